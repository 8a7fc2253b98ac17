#![deny(clippy::all)]

pub mod call;
pub mod codec;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
mod fs;
pub mod outcome;
pub mod process;
pub mod provision;
pub mod runner;
pub mod shm;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use call::{CallEngine, ImageFrame, Step};
pub use codec::FrameChannel;
pub use config::{GlobalOptions, RunnerConfig};
pub use engine::RunnerEngine;
pub use error::{Result, RunnerError};
pub use outcome::{
    format_status_message, to_json_response, CommandGroup, CommandInfo, CommandStatus,
    ExecutionOutcome,
};
pub use process::{CommandRunner, RunOutput, SystemCommandRunner};
pub use provision::{Environment, Provisioner};
pub use runner::{LaunchSpec, ProcessOptions, RunnerProcess, Supervisor};
pub use shm::{FileShmChannel, ImageChannel, ShmLease};
pub use store::{ArchiveInspection, InstallOutcome, InstallResult, PackageStore};

pub const PVR_VERSION: &str = env!("CARGO_PKG_VERSION");
