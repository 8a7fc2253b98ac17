use std::io;

use serde_json::{json, Value};

/// Failures surfaced by the runner, one variant per error class.
///
/// Codes are stable and shared with the algorithm SDK; algorithm-reported
/// failures keep whatever code the child sent.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no active package for pid `{pid}`")]
    InvalidPid { pid: String },
    #[error("image transfer failed: {0}")]
    ImageTransfer(String),
    #[error("call {request_id} timed out after {timeout_ms} ms")]
    CallTimeout { request_id: String, timeout_ms: u128 },
    #[error("invalid package: {0}")]
    InvalidPackage(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error("no compatible python interpreter: {0}")]
    IncompatiblePython(String),
    #[error("wheels missing: {0}")]
    WheelsMissing(String),
    #[error("install failed: {0}")]
    Install(String),
    #[error("activation conflict: {0}")]
    ActivationConflict(String),
    #[error("refusing to uninstall {package}: still active for {}", .pids.join(", "))]
    UnsafeUninstall { package: String, pids: Vec<String> },
    #[error("package {0} is not installed")]
    NotInstalled(String),
    #[error("provisioning failed: {0}")]
    Provision(String),
    #[error("runner failed to start: {0}")]
    Startup(String),
    #[error("runner process crashed: {0}")]
    ProcessCrashed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("algorithm error [{code}]: {message}")]
    AlgorithmExecution { code: String, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;

impl RunnerError {
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidPid { .. } => "1001",
            Self::ImageTransfer(_) => "1002",
            Self::CallTimeout { .. } => "1005",
            Self::InvalidPackage(_) => "2001",
            Self::Manifest(_) => "2002",
            Self::IncompatiblePython(_) => "2003",
            Self::WheelsMissing(_) => "2004",
            Self::Install(_) => "2005",
            Self::ActivationConflict(_) => "2006",
            Self::UnsafeUninstall { .. } => "2007",
            Self::NotInstalled(_) => "2008",
            Self::Provision(_) => "2009",
            Self::Startup(_) => "3001",
            Self::ProcessCrashed(_) => "3002",
            Self::Protocol(_) => "3003",
            Self::AlgorithmExecution { code, .. } => code.as_str(),
            Self::Io(_) => "9999",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPid { .. } => "invalid_pid",
            Self::ImageTransfer(_) => "image_transfer",
            Self::CallTimeout { .. } => "call_timeout",
            Self::InvalidPackage(_) => "invalid_package",
            Self::Manifest(_) => "manifest",
            Self::IncompatiblePython(_) => "incompatible_python",
            Self::WheelsMissing(_) => "wheels_missing",
            Self::Install(_) => "install",
            Self::ActivationConflict(_) => "activation_conflict",
            Self::UnsafeUninstall { .. } => "unsafe_uninstall",
            Self::NotInstalled(_) => "not_installed",
            Self::Provision(_) => "provision",
            Self::Startup(_) => "startup",
            Self::ProcessCrashed(_) => "process_crashed",
            Self::Protocol(_) => "protocol",
            Self::AlgorithmExecution { .. } => "algorithm_execution",
            Self::Io(_) => "io",
        }
    }

    /// Errors caused by operator input rather than the runner or the algorithm.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPid { .. }
                | Self::InvalidPackage(_)
                | Self::Manifest(_)
                | Self::WheelsMissing(_)
                | Self::ActivationConflict(_)
                | Self::UnsafeUninstall { .. }
                | Self::NotInstalled(_)
        )
    }

    pub fn details(&self) -> Value {
        let mut details = json!({
            "code": self.code(),
            "kind": self.kind(),
        });
        match self {
            Self::UnsafeUninstall { package, pids } => {
                details["package"] = json!(package);
                details["active_pids"] = json!(pids);
                details["hint"] = json!("deactivate the listed pids first");
            }
            Self::InvalidPid { pid } => {
                details["pid"] = json!(pid);
                details["hint"] = json!(format!("run `pvr activate {pid} <NAME> <VERSION>`"));
            }
            Self::CallTimeout { request_id, .. } => {
                details["request_id"] = json!(request_id);
            }
            _ => {}
        }
        details
    }

    pub(crate) fn install(err: &anyhow::Error) -> Self {
        Self::Install(format!("{err:#}"))
    }

    pub(crate) fn provision(err: &anyhow::Error) -> Self {
        Self::Provision(format!("{err:#}"))
    }
}
