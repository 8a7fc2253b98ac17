use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADAPTER_MODULE: &str = "procvision_algorithm_sdk.adapter";

const DEFAULT_EXECUTE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STOP_GRACE_MS: u64 = 2_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_HEARTBEAT_GRACE_MS: u64 = 2_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalOptions {
    pub quiet: bool,
    pub verbose: u8,
    pub trace: bool,
    pub json: bool,
    pub root: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    fn millis(&self, key: &str, default: u64) -> Result<u64> {
        match self.var(key) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{key} must be a whole number of milliseconds, got `{raw}`")),
            None => Ok(default),
        }
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Runner settings, resolved once per process from `PVR_*` variables.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub root: PathBuf,
    pub shm_dir: PathBuf,
    /// Explicit host interpreter; `None` means search `PATH`.
    pub python: Option<PathBuf>,
    /// Explicit conda-like tool; `None` means search `PATH`.
    pub conda: Option<PathBuf>,
    pub adapter_module: String,
    pub execute_timeout: Duration,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_grace: Duration,
    /// Stop a runner after this many timeouts in a row; `0` never does.
    pub max_consecutive_timeouts: u32,
}

impl RunnerConfig {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a variable holds an unparsable value or no home
    /// directory can be found for the default root.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    /// Environment configuration with command-line overrides applied.
    ///
    /// # Errors
    /// See [`RunnerConfig::from_env`].
    pub fn for_options(global: &GlobalOptions) -> Result<Self> {
        Self::from_snapshot_with(&EnvSnapshot::capture(), global)
    }

    fn from_snapshot_with(snapshot: &EnvSnapshot, global: &GlobalOptions) -> Result<Self> {
        match global.root.as_deref() {
            // an explicit root must not require a home directory
            Some(root) => {
                let mut vars = snapshot.vars.clone();
                vars.insert("PVR_ROOT".to_string(), root.to_string());
                Self::from_snapshot(&EnvSnapshot { vars })
            }
            None => Self::from_snapshot(snapshot),
        }
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let root = match snapshot.var("PVR_ROOT") {
            Some(root) => PathBuf::from(root),
            None => default_root()?,
        };
        let heartbeat_ms =
            snapshot.millis("PVR_HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_INTERVAL_MS)?;
        let max_timeouts = match snapshot.var("PVR_MAX_CONSECUTIVE_TIMEOUTS") {
            Some(raw) => raw.trim().parse::<u32>().with_context(|| {
                format!("PVR_MAX_CONSECUTIVE_TIMEOUTS must be a whole number, got `{raw}`")
            })?,
            None => 0,
        };
        Ok(Self {
            root,
            shm_dir: snapshot
                .var("PVR_SHM_DIR")
                .map_or_else(default_shm_dir, PathBuf::from),
            python: snapshot.var("PVR_PYTHON").map(PathBuf::from),
            conda: snapshot.var("PVR_CONDA").map(PathBuf::from),
            adapter_module: snapshot
                .var("PVR_ADAPTER_MODULE")
                .unwrap_or(DEFAULT_ADAPTER_MODULE)
                .to_string(),
            execute_timeout: Duration::from_millis(
                snapshot.millis("PVR_EXECUTE_TIMEOUT_MS", DEFAULT_EXECUTE_TIMEOUT_MS)?,
            ),
            startup_timeout: Duration::from_millis(
                snapshot.millis("PVR_STARTUP_TIMEOUT_MS", DEFAULT_STARTUP_TIMEOUT_MS)?,
            ),
            stop_grace: Duration::from_millis(
                snapshot.millis("PVR_STOP_GRACE_MS", DEFAULT_STOP_GRACE_MS)?,
            ),
            heartbeat_interval: (heartbeat_ms > 0).then(|| Duration::from_millis(heartbeat_ms)),
            heartbeat_grace: Duration::from_millis(
                snapshot.millis("PVR_HEARTBEAT_GRACE_MS", DEFAULT_HEARTBEAT_GRACE_MS)?,
            ),
            max_consecutive_timeouts: max_timeouts,
        })
    }

    /// Defaults rooted at `root`, ignoring the environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            shm_dir: root.join("shm"),
            root,
            python: None,
            conda: None,
            adapter_module: DEFAULT_ADAPTER_MODULE.to_string(),
            execute_timeout: Duration::from_millis(DEFAULT_EXECUTE_TIMEOUT_MS),
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            heartbeat_interval: Some(Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS)),
            heartbeat_grace: Duration::from_millis(DEFAULT_HEARTBEAT_GRACE_MS),
            max_consecutive_timeouts: 0,
        }
    }

    pub fn zips_dir(&self) -> PathBuf {
        self.root.join("zips")
    }

    pub fn deployed_dir(&self) -> PathBuf {
        self.root.join("deployed")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn default_root() -> Result<PathBuf> {
    dirs_next::home_dir()
        .map(|home| home.join(".pvr"))
        .ok_or_else(|| anyhow!("cannot determine home directory; set PVR_ROOT"))
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.join("pvr")
    } else {
        env::temp_dir().join("pvr_shm")
    }
}
