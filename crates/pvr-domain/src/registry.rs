use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::package::PackageKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Installed,
    Invalid,
}

/// Which resolver produced the interpreter behind an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterSource {
    Bundled,
    Conda,
    Host,
}

impl InterpreterSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bundled => "bundled",
            Self::Conda => "conda",
            Self::Host => "host",
        }
    }
}

impl fmt::Display for InterpreterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub source: InterpreterSource,
    /// Interpreter that created the environment.
    pub base_interpreter: PathBuf,
    /// Interpreter inside the environment, used to launch runners.
    pub python: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    /// Hex SHA-256 of `requirements.txt` at provisioning time.
    pub requirements_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Ready,
    Broken(String),
}

impl EnvironmentStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub version: String,
    pub entry_point: String,
    pub supported_pids: Vec<String>,
    pub status: PackageState,
    pub installed_at: String,
    pub install_path: PathBuf,
    /// Directory holding `manifest.json`; the runner's working directory.
    pub working_dir: PathBuf,
    pub environment_path: PathBuf,
    pub environment: EnvironmentRecord,
}

impl RegistryEntry {
    pub fn key(&self) -> PackageKey {
        PackageKey {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn supports(&self, pid: &str) -> bool {
        self.supported_pids.iter().any(|candidate| candidate == pid)
    }
}

/// Persisted `pid -> package` activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMapping {
    pub name: String,
    pub version: String,
    pub activated_at: String,
}

impl ActiveMapping {
    pub fn key(&self) -> PackageKey {
        PackageKey {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}
