use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use pvr_domain::{ImageMeta, InterpreterSource, PixelFormat};

use crate::call::{ImageFrame, Step};
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::process::{CommandRunner, RunOutput};
use crate::provision::env_python;
use crate::shm::ImageChannel;

/// Stands in for python, pip and conda.
pub(crate) struct FakeRunner {
    pub host_version: String,
    pub fail_pip: bool,
    pub fail_venv: bool,
    /// Written as the environment interpreter.
    pub env_script: String,
    pub calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            host_version: "3.12.1".into(),
            fail_pip: false,
            fail_venv: false,
            env_script: "#!/bin/sh\necho 3.12.1\n".into(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRunner {
    pub fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.calls()
            .iter()
            .any(|(_, args)| args.iter().any(|arg| arg == needle))
    }

    fn make_env(&self, dir: &Path, source: InterpreterSource) -> Result<()> {
        let python = env_python(dir, source);
        fs::create_dir_all(python.parent().unwrap())?;
        fs::write(&python, &self.env_script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&python, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }
}

fn ok(stdout: &str) -> RunOutput {
    RunOutput {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> RunOutput {
    RunOutput {
        code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &Path, args: &[String], _cwd: &Path) -> Result<RunOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec()));
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = match argv.as_slice() {
            ["-c", _] => ok(&format!("{}\n", self.host_version)),
            ["-m", "venv", dir] => {
                if self.fail_venv {
                    failed("Error: venv module unavailable")
                } else {
                    self.make_env(Path::new(dir), InterpreterSource::Host)?;
                    ok("")
                }
            }
            ["create", "-p", dir, ..] => {
                self.make_env(Path::new(dir), InterpreterSource::Conda)?;
                ok("")
            }
            ["-m", "pip", "install", ..] => {
                if self.fail_pip {
                    failed("ERROR: Could not find a version that satisfies the requirement")
                } else {
                    ok("Successfully installed")
                }
            }
            _ => RunOutput {
                code: 127,
                stdout: String::new(),
                stderr: format!("unexpected invocation {argv:?}"),
            },
        };
        Ok(output)
    }
}

pub(crate) fn test_config(root: &Path) -> RunnerConfig {
    let mut config = RunnerConfig::with_root(root);
    config.python = Some(PathBuf::from("/opt/host/bin/python3"));
    config.conda = None;
    config
}

/// In-memory zip builder for package archives.
pub(crate) struct ArchiveBuilder {
    entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn manifest(entry_point: &str, pids: &[&str]) -> Self {
        let manifest = serde_json::json!({
            "entry_point": entry_point,
            "supported_pids": pids,
        });
        Self::new().file("manifest.json", manifest.to_string().as_bytes())
    }

    /// `manifest.json`, empty `requirements.txt` and an empty `wheels/`.
    pub fn demo(entry_point: &str, pids: &[&str]) -> Self {
        Self::manifest(entry_point, pids)
            .file("requirements.txt", b"")
            .dir("wheels/")
    }

    pub fn file(mut self, name: &str, contents: &[u8]) -> Self {
        self.entries.push((name.to_string(), contents.to_vec()));
        self
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push((name.to_string(), Vec::new()));
        self
    }

    pub fn write(self, path: &Path) -> PathBuf {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, contents) in self.entries {
            if name.ends_with('/') {
                zip.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                zip.start_file(name, options).unwrap();
                zip.write_all(&contents).unwrap();
            }
        }
        zip.finish().unwrap();
        path.to_path_buf()
    }
}

/// In-memory image channel that counts allocations and releases.
#[derive(Default)]
pub(crate) struct CountingImages {
    segments: Mutex<std::collections::HashMap<String, (Vec<u8>, ImageMeta)>>,
    pub allocated: AtomicUsize,
    pub released: AtomicUsize,
    /// Fail the n-th allocation (1-based).
    pub fail_allocation: Option<usize>,
}

impl CountingImages {
    pub fn failing_at(allocation: usize) -> Self {
        Self {
            fail_allocation: Some(allocation),
            ..Self::default()
        }
    }

    pub fn balanced(&self) -> bool {
        self.allocated.load(Ordering::SeqCst) == self.released.load(Ordering::SeqCst)
            && self.segments.lock().unwrap().is_empty()
    }

    pub fn live(&self) -> usize {
        self.segments.lock().unwrap().len()
    }
}

impl ImageChannel for CountingImages {
    fn allocate(&self, bytes: &[u8], meta: &ImageMeta) -> crate::error::Result<String> {
        let attempt = self.allocated.load(Ordering::SeqCst) + 1;
        if self.fail_allocation == Some(attempt) {
            return Err(RunnerError::ImageTransfer("segment quota exhausted".into()));
        }
        self.allocated.fetch_add(1, Ordering::SeqCst);
        let id = format!("pvr-{attempt:032x}");
        self.segments
            .lock()
            .unwrap()
            .insert(id.clone(), (bytes.to_vec(), *meta));
        Ok(id)
    }

    fn release(&self, shm_id: &str) -> crate::error::Result<()> {
        match self.segments.lock().unwrap().remove(shm_id) {
            Some(_) => {
                self.released.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RunnerError::ImageTransfer(format!("{shm_id} released twice"))),
        }
    }

    fn read(&self, shm_id: &str) -> crate::error::Result<(Vec<u8>, ImageMeta)> {
        self.segments
            .lock()
            .unwrap()
            .get(shm_id)
            .cloned()
            .ok_or_else(|| RunnerError::ImageTransfer(format!("{shm_id} unknown")))
    }
}

pub(crate) fn gray_step(index: u32) -> Step {
    let frame = ImageFrame {
        bytes: vec![7; 16],
        meta: ImageMeta::raw(4, 4, PixelFormat::Gray8, 16).unwrap(),
    };
    Step {
        step_index: index,
        step_desc: format!("step {index}"),
        guide_info: serde_json::json!({"roi": [0, 0, 4, 4]}),
        current: frame.clone(),
        guide: frame,
        timeout: None,
    }
}
