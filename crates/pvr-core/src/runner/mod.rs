//! Child process lifecycle: launch, handshake, heartbeat, stop.

mod process;
mod supervisor;

pub use process::{LaunchSpec, ProcessOptions, RunnerProcess};
pub use supervisor::{ProcessSlot, Supervisor};
pub(crate) use supervisor::lock;
