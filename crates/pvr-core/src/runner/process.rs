use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use pvr_domain::{ChildMessage, HostMessage, ProcessEvent, ProcessState, RegistryEntry};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use super::lock;
use crate::codec::{decode_child_message, encode_message, read_frame, write_frame, FrameChannel};
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};

const EXIT_POLL: Duration = Duration::from_millis(20);
const ALGO_TARGET: &str = "pvr::algo";

/// How to launch the adapter for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// `<venv python> -m <adapter> --entry <entry_point>` in the package's
    /// working directory.
    pub fn for_entry(entry: &RegistryEntry, config: &RunnerConfig) -> Self {
        Self {
            program: entry.environment.python.clone(),
            args: vec![
                "-m".to_string(),
                config.adapter_module.clone(),
                "--entry".to_string(),
                entry.entry_point.clone(),
            ],
            cwd: entry.working_dir.clone(),
            env: vec![
                ("PROC_ENV".into(), "prod".into()),
                ("PYTHONUNBUFFERED".into(), "1".into()),
                (
                    "PROC_ALGO_ROOT".into(),
                    entry.working_dir.display().to_string(),
                ),
                ("PROC_SHM_DIR".into(), config.shm_dir.display().to_string()),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_grace: Duration,
}

impl ProcessOptions {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout,
            stop_grace: config.stop_grace,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_grace: config.heartbeat_grace,
        }
    }
}

enum FrameEvent {
    Message(ChildMessage),
    Garbled(String),
    Closed(Option<String>),
}

/// One encoded frame for the stdin writer thread.
struct WriteJob {
    payload: Vec<u8>,
    done: Sender<io::Result<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Written,
    /// Still queued or half written when the wait ran out.
    Pending,
}

struct Shared {
    label: String,
    state: Mutex<ProcessState>,
    last_seen: Mutex<Instant>,
    /// Feeds the writer thread; dropping it closes the child's stdin.
    stdin: Mutex<Option<Sender<WriteJob>>>,
    child: Mutex<Child>,
}

impl Shared {
    fn state(&self) -> ProcessState {
        *lock(&self.state)
    }

    fn transition(&self, event: ProcessEvent) -> Result<ProcessState> {
        let mut state = lock(&self.state);
        let next = state
            .apply(event)
            .map_err(|err| RunnerError::Protocol(format!("{}: {err}", self.label)))?;
        if next != *state {
            debug!(runner = %self.label, from = %*state, to = %next, "state change");
        }
        *state = next;
        Ok(next)
    }

    /// Records an unexpected exit; a no-op once stopped or crashed.
    fn mark_exited(&self, reason: &str) {
        let mut state = lock(&self.state);
        if state.is_live() {
            warn!(runner = %self.label, reason, "runner process died");
            if let Ok(next) = state.apply(ProcessEvent::Exited) {
                *state = next;
            }
        }
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Queues a frame without waiting for it to reach the pipe.
    fn post(&self, message: &HostMessage) -> Result<Receiver<io::Result<()>>> {
        let payload = encode_message(message)?;
        let (done, written) = bounded(1);
        let closed = || RunnerError::ProcessCrashed(format!("{} stdin is closed", self.label));
        let writer = lock(&self.stdin).clone().ok_or_else(closed)?;
        writer
            .send(WriteJob { payload, done })
            .map_err(|_| closed())?;
        Ok(written)
    }

    /// Queues a frame and waits up to `within` for the writer to finish it.
    fn write(&self, message: &HostMessage, within: Duration) -> Result<Delivery> {
        let written = self.post(message)?;
        match written.recv_timeout(within) {
            Ok(Ok(())) => Ok(Delivery::Written),
            Ok(Err(err)) => Err(RunnerError::ProcessCrashed(format!(
                "{}: write failed: {err}",
                self.label
            ))),
            Err(RecvTimeoutError::Timeout) => Ok(Delivery::Pending),
            Err(RecvTimeoutError::Disconnected) => Err(RunnerError::ProcessCrashed(format!(
                "{}: stdin writer is gone",
                self.label
            ))),
        }
    }

    fn try_exit_status(&self) -> Option<ExitStatus> {
        lock(&self.child).try_wait().ok().flatten()
    }

    fn wait_for_exit(&self, within: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + within;
        loop {
            if let Some(status) = self.try_exit_status() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    fn kill(&self) {
        let mut child = lock(&self.child);
        if let Err(err) = child.kill() {
            trace!(runner = %self.label, error = %err, "kill failed");
        }
        let _ = child.wait();
    }
}

/// A live adapter child speaking the framed protocol over stdio.
pub struct RunnerProcess {
    shared: Arc<Shared>,
    events: Receiver<FrameEvent>,
    heartbeat_stop: Option<Sender<()>>,
    options: ProcessOptions,
    pid: u32,
}

impl RunnerProcess {
    /// Spawns the child and waits for its hello.
    ///
    /// # Errors
    /// `Startup` when the program cannot be spawned, exits, or stays silent
    /// past the startup timeout. The child is reaped on every error path.
    pub fn start(label: &str, spec: &LaunchSpec, options: ProcessOptions) -> Result<Self> {
        info!(runner = label, program = %spec.program.display(), "starting runner");
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                RunnerError::Startup(format!(
                    "failed to launch {}: {err}",
                    spec.program.display()
                ))
            })?;
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunnerError::Startup(format!("{label}: stdio pipes unavailable")));
        };

        let (writer, jobs) = unbounded();
        let shared = Arc::new(Shared {
            label: label.to_string(),
            state: Mutex::new(ProcessState::Stopped.apply(ProcessEvent::Launch).map_err(
                |err| RunnerError::Startup(format!("{err:#}")),
            )?),
            last_seen: Mutex::new(Instant::now()),
            stdin: Mutex::new(Some(writer)),
            child: Mutex::new(child),
        });
        let (tx, events) = unbounded();
        if let Err(err) = spawn_stdin_writer(label, stdin, jobs)
            .and_then(|()| spawn_stdout_reader(shared.clone(), stdout, tx))
        {
            shared.kill();
            return Err(err);
        }
        spawn_stderr_forwarder(label, stderr)?;

        let mut process = Self {
            shared,
            events,
            heartbeat_stop: None,
            options,
            pid,
        };
        process.handshake()?;
        if let Some(interval) = options.heartbeat_interval {
            process.heartbeat_stop = Some(spawn_heartbeat(
                process.shared.clone(),
                interval,
                options.heartbeat_grace,
            )?);
        }
        info!(runner = label, pid, "runner ready");
        Ok(process)
    }

    fn handshake(&mut self) -> Result<()> {
        let label = self.shared.label.clone();
        let deadline = Instant::now() + self.options.startup_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RunnerError::Startup(format!(
                    "{label}: no hello within {} ms",
                    self.options.startup_timeout.as_millis()
                )));
            }
            match self.events.recv_timeout(remaining) {
                Ok(FrameEvent::Message(ChildMessage::Hello { sdk_version })) => {
                    debug!(runner = %label, sdk_version = ?sdk_version, "hello received");
                    break;
                }
                Ok(FrameEvent::Message(other)) => {
                    debug!(runner = %label, message = ?other, "ignoring message before hello");
                }
                Ok(FrameEvent::Garbled(reason)) => {
                    return Err(RunnerError::Startup(format!(
                        "{label}: garbled handshake: {reason}"
                    )));
                }
                Ok(FrameEvent::Closed(_)) | Err(RecvTimeoutError::Disconnected) => {
                    let status = self
                        .shared
                        .wait_for_exit(Duration::from_millis(500))
                        .map_or_else(|| "unknown".to_string(), |status| status.to_string());
                    self.shared.mark_exited("exited during startup");
                    return Err(RunnerError::Startup(format!(
                        "{label}: exited before handshake ({status})"
                    )));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        let hello = HostMessage::Hello {
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval_ms: self
                .options
                .heartbeat_interval
                .map_or(0, |interval| interval.as_millis() as u64),
            heartbeat_grace_ms: self.options.heartbeat_grace.as_millis() as u64,
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.shared.write(&hello, remaining) {
            Ok(Delivery::Written) => {}
            Ok(Delivery::Pending) => {
                return Err(RunnerError::Startup(format!(
                    "{label}: child did not read the hello reply"
                )))
            }
            Err(err) => return Err(RunnerError::Startup(err.to_string())),
        }
        self.shared.touch();
        self.shared.transition(ProcessEvent::Handshake)?;
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }

    /// Re-checks the child and reports whether it can take calls.
    pub fn is_alive(&self) -> bool {
        self.refresh();
        self.state().is_live()
    }

    fn refresh(&self) {
        if self.state().is_live() {
            if let Some(status) = self.shared.try_exit_status() {
                self.shared.mark_exited(&format!("exited with {status}"));
            }
        }
    }

    fn crashed(&self, reason: &str) -> RunnerError {
        RunnerError::ProcessCrashed(format!("{}: {reason}", self.shared.label))
    }

    /// Marks the process busy for one call.
    ///
    /// # Errors
    /// `ProcessCrashed` if the child is gone.
    pub fn begin_call(&mut self) -> Result<()> {
        self.refresh();
        match self.state() {
            ProcessState::Ready => {
                self.shared.transition(ProcessEvent::CallStarted)?;
                Ok(())
            }
            ProcessState::Crashed | ProcessState::Stopped => Err(self.crashed("not running")),
            other => Err(RunnerError::Protocol(format!(
                "{} cannot take a call while {other}",
                self.shared.label
            ))),
        }
    }

    pub fn end_call(&mut self) {
        if let Err(err) = self.shared.transition(ProcessEvent::CallFinished) {
            warn!(runner = %self.shared.label, error = %err, "unexpected call completion");
        }
        self.shared.touch();
    }

    /// Asks the child to exit, escalating to SIGTERM and then a kill. Safe
    /// to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(stop) = self.heartbeat_stop.take() {
            let _ = stop.send(());
        }
        if self.state() == ProcessState::Stopped {
            return;
        }
        let label = self.shared.label.clone();
        if self.shared.try_exit_status().is_none() {
            if let Err(err) = self.shared.post(&HostMessage::Shutdown) {
                trace!(runner = %label, error = %err, "shutdown frame not delivered");
            }
            // the writer closes stdin once its queue drains
            lock(&self.shared.stdin).take();
            let half = self.options.stop_grace / 2;
            if self.shared.wait_for_exit(half).is_none() {
                self.terminate();
                if self.shared.wait_for_exit(self.options.stop_grace - half).is_none() {
                    warn!(runner = %label, "runner ignored termination; killing");
                }
            }
        }
        self.shared.kill();
        if let Err(err) = self.shared.transition(ProcessEvent::Stopped) {
            error!(runner = %label, error = %err, "failed to record stop");
        }
        info!(runner = %label, "runner stopped");
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(self.pid) else {
            return;
        };
        debug!(runner = %self.shared.label, pid = raw, "sending SIGTERM");
        if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            trace!(runner = %self.shared.label, error = %err, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

impl FrameChannel for RunnerProcess {
    fn send(&mut self, message: &HostMessage, timeout: Duration) -> Result<()> {
        self.refresh();
        if !self.state().is_live() {
            return Err(self.crashed(&format!("process is {}", self.state())));
        }
        match self.shared.write(message, timeout) {
            Ok(Delivery::Written) => Ok(()),
            Ok(Delivery::Pending) => {
                // a partial frame leaves the stream unusable
                self.shared.mark_exited("stdin stalled");
                self.shared.kill();
                let request_id = match message {
                    HostMessage::Execute(request) => request.request_id.clone(),
                    _ => String::new(),
                };
                Err(RunnerError::CallTimeout {
                    request_id,
                    timeout_ms: timeout.as_millis(),
                })
            }
            Err(err) => {
                self.shared.mark_exited("stdin closed");
                Err(err)
            }
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<ChildMessage>> {
        match self.events.recv_timeout(timeout) {
            Ok(FrameEvent::Message(message)) => Ok(Some(message)),
            Ok(FrameEvent::Garbled(reason)) => Err(RunnerError::Protocol(format!(
                "{}: {reason}",
                self.shared.label
            ))),
            Ok(FrameEvent::Closed(reason)) => {
                let status = self
                    .shared
                    .wait_for_exit(Duration::from_millis(200))
                    .map_or_else(|| "still running".to_string(), |status| status.to_string());
                self.shared.mark_exited("output closed");
                Err(self.crashed(&match reason {
                    Some(reason) => format!("output closed ({reason}); {status}"),
                    None => format!("output closed; {status}"),
                }))
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.state() == ProcessState::Crashed {
                    return Err(self.crashed("stopped answering heartbeats"));
                }
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.shared.mark_exited("reader gone");
                Err(self.crashed("output reader is gone"))
            }
        }
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_stdin_writer(
    label: &str,
    mut stdin: impl Write + Send + 'static,
    jobs: Receiver<WriteJob>,
) -> Result<()> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("pvr-in-{label}"))
        .spawn(move || {
            for job in jobs {
                let outcome = write_frame(&mut stdin, &job.payload);
                let failed = outcome.is_err();
                if let Err(err) = &outcome {
                    debug!(runner = %label, error = %err, "stdin write failed");
                }
                let _ = job.done.send(outcome);
                if failed {
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(|err| RunnerError::Startup(format!("cannot spawn stdin thread: {err}")))
}

fn spawn_stdout_reader(
    shared: Arc<Shared>,
    mut stdout: impl Read + Send + 'static,
    tx: Sender<FrameEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("pvr-out-{}", shared.label))
        .spawn(move || loop {
            let event = match read_frame(&mut stdout) {
                Ok(Some(payload)) => {
                    shared.touch();
                    match decode_child_message(&payload) {
                        Ok(ChildMessage::Pong) => {
                            trace!(runner = %shared.label, "pong");
                            continue;
                        }
                        Ok(ChildMessage::Unknown) => {
                            warn!(runner = %shared.label, "ignoring message of unknown type");
                            continue;
                        }
                        Ok(message) => FrameEvent::Message(message),
                        Err(err) => FrameEvent::Garbled(err.to_string()),
                    }
                }
                Ok(None) => FrameEvent::Closed(None),
                Err(err) => FrameEvent::Closed(Some(err.to_string())),
            };
            let closed = matches!(event, FrameEvent::Closed(_));
            if tx.send(event).is_err() || closed {
                break;
            }
        })
        .map(|_| ())
        .map_err(|err| RunnerError::Startup(format!("cannot spawn reader thread: {err}")))
}

fn spawn_stderr_forwarder(label: &str, stderr: impl Read + Send + 'static) -> Result<()> {
    let label = label.to_string();
    thread::Builder::new()
        .name(format!("pvr-err-{label}"))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else {
                    break;
                };
                forward_log_line(&label, &line);
            }
        })
        .map(|_| ())
        .map_err(|err| RunnerError::Startup(format!("cannot spawn stderr thread: {err}")))
}

/// Structured lines (`{"level": .., "message": ..}`) keep their level.
fn forward_log_line(label: &str, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let parsed = serde_json::from_str::<Value>(trimmed).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(trimmed);
    let level = parsed
        .as_ref()
        .and_then(|value| value.get("level"))
        .and_then(Value::as_str)
        .unwrap_or("info")
        .to_ascii_lowercase();
    match level.as_str() {
        "error" | "critical" | "fatal" => error!(target: ALGO_TARGET, runner = label, "{message}"),
        "warn" | "warning" => warn!(target: ALGO_TARGET, runner = label, "{message}"),
        "debug" => debug!(target: ALGO_TARGET, runner = label, "{message}"),
        "trace" => trace!(target: ALGO_TARGET, runner = label, "{message}"),
        _ => info!(target: ALGO_TARGET, runner = label, "{message}"),
    }
}

fn spawn_heartbeat(shared: Arc<Shared>, interval: Duration, grace: Duration) -> Result<Sender<()>> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    thread::Builder::new()
        .name(format!("pvr-hb-{}", shared.label))
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            match shared.state() {
                ProcessState::Ready => {}
                ProcessState::Busy | ProcessState::Starting => continue,
                ProcessState::Crashed | ProcessState::Stopped => break,
            }
            let silent_for = lock(&shared.last_seen).elapsed();
            if silent_for > interval + grace {
                shared.mark_exited(&format!(
                    "no heartbeat reply for {} ms",
                    silent_for.as_millis()
                ));
                shared.kill();
                break;
            }
            // an unread ping stays queued; silence detection covers a hung child
            if let Err(err) = shared.post(&HostMessage::Ping) {
                debug!(runner = %shared.label, error = %err, "ping failed");
            }
        })
        .map_err(|err| RunnerError::Startup(format!("cannot spawn heartbeat thread: {err}")))?;
    Ok(stop_tx)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const HELLO: &str = r#"printf '\000\000\000\020{"type":"hello"}'"#;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        }
    }

    fn options() -> ProcessOptions {
        ProcessOptions {
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(400),
            heartbeat_interval: None,
            heartbeat_grace: Duration::from_millis(50),
        }
    }

    #[test]
    fn immediate_exit_is_a_startup_error() {
        let err = RunnerProcess::start("t", &sh("exit 4"), options()).err().unwrap();
        assert_eq!(err.code(), "3001");
        assert!(err.to_string().contains("exited before handshake"));
    }

    #[test]
    fn missing_program_is_a_startup_error() {
        let spec = LaunchSpec {
            program: PathBuf::from("/definitely/not/python"),
            ..sh("")
        };
        let err = RunnerProcess::start("t", &spec, options()).err().unwrap();
        assert_eq!(err.code(), "3001");
    }

    #[test]
    fn silent_child_fails_handshake() {
        let opts = ProcessOptions {
            startup_timeout: Duration::from_millis(150),
            ..options()
        };
        let started = Instant::now();
        let err = RunnerProcess::start("t", &sh("exec sleep 30"), opts).err().unwrap();
        assert!(err.to_string().contains("no hello"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn hello_reaches_ready_and_stop_is_idempotent() {
        let script = format!("{HELLO}; exec sleep 30");
        let mut process = RunnerProcess::start("t", &sh(&script), options()).unwrap();
        assert_eq!(process.state(), ProcessState::Ready);
        assert!(process.is_alive());
        process.begin_call().unwrap();
        assert_eq!(process.state(), ProcessState::Busy);
        process.end_call();
        process.stop();
        assert_eq!(process.state(), ProcessState::Stopped);
        process.stop();
        assert!(!process.is_alive());
        assert!(process.begin_call().is_err());
    }

    #[test]
    fn crash_after_handshake_fails_calls_fast() {
        let script = format!("{HELLO}; head -c 4 >/dev/null; exit 3");
        let mut process = RunnerProcess::start("t", &sh(&script), options()).unwrap();
        let started = Instant::now();
        let err = loop {
            match process.recv_timeout(Duration::from_secs(5)) {
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        assert_eq!(err.code(), "3002");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(process.state(), ProcessState::Crashed);
        assert!(process.send(&HostMessage::Ping, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn unread_request_times_out_instead_of_blocking() {
        use crate::call::CallEngine;
        use crate::test_support::{gray_step, CountingImages};

        let script = format!("{HELLO}; exec sleep 30");
        let mut process = RunnerProcess::start("t", &sh(&script), options()).unwrap();
        process.begin_call().unwrap();
        let mut step = gray_step(0);
        step.guide_info = Value::String("x".repeat(1024 * 1024));

        let (done_tx, done_rx) = bounded(1);
        let worker = thread::spawn(move || {
            let images = CountingImages::default();
            let started = Instant::now();
            let outcome = CallEngine::new(&images).execute(
                &mut process,
                None,
                &step,
                Duration::from_millis(200),
            );
            let _ = done_tx.send((outcome, started.elapsed(), images.live(), process.state()));
        });
        let (outcome, elapsed, live, state) = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("execute returned");
        worker.join().unwrap();

        let err = outcome.unwrap_err();
        assert_eq!(err.code(), "1005");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert_eq!(live, 0);
        assert_eq!(state, ProcessState::Crashed);
    }

    #[test]
    fn lost_heartbeat_marks_crashed() {
        let script = format!("{HELLO}; exec sleep 30");
        let opts = ProcessOptions {
            heartbeat_interval: Some(Duration::from_millis(40)),
            heartbeat_grace: Duration::from_millis(40),
            ..options()
        };
        let process = RunnerProcess::start("t", &sh(&script), opts).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.state() != ProcessState::Crashed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(process.state(), ProcessState::Crashed);
        assert!(!process.is_alive());
    }

    #[test]
    fn launch_spec_for_entry() {
        let temp = tempfile::tempdir().unwrap();
        let config = RunnerConfig::with_root(temp.path());
        let entry: RegistryEntry = serde_json::from_value(serde_json::json!({
            "name": "demo",
            "version": "1.0.0",
            "entry_point": "demo.run",
            "supported_pids": ["P1"],
            "status": "installed",
            "installed_at": "2026-01-01T00:00:00Z",
            "install_path": "/pvr/deployed/demo/1.0.0",
            "working_dir": "/pvr/deployed/demo/1.0.0/demo",
            "environment_path": "/pvr/deployed/demo/1.0.0/venv",
            "environment": {
                "source": "host",
                "base_interpreter": "/usr/bin/python3",
                "python": "/pvr/deployed/demo/1.0.0/venv/bin/python",
                "requirements_hash": ""
            }
        }))
        .unwrap();
        let spec = LaunchSpec::for_entry(&entry, &config);
        assert_eq!(
            spec.args,
            vec!["-m", "procvision_algorithm_sdk.adapter", "--entry", "demo.run"]
        );
        assert!(spec
            .env
            .contains(&("PROC_ALGO_ROOT".into(), "/pvr/deployed/demo/1.0.0/demo".into())));
        assert_eq!(spec.cwd, PathBuf::from("/pvr/deployed/demo/1.0.0/demo"));
    }
}
