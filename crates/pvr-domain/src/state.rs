//! Liveness of a runner child process.
//!
//! All state changes go through [`ProcessState::apply`]; callers never assign
//! a state directly.

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Busy,
    Crashed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The child was spawned.
    Launch,
    /// The child completed the hello exchange.
    Handshake,
    CallStarted,
    CallFinished,
    /// The child exited, or stopped answering heartbeats, without being asked to.
    Exited,
    /// An explicit stop finished.
    Stopped,
}

impl ProcessState {
    pub fn apply(self, event: ProcessEvent) -> Result<Self> {
        use ProcessEvent as E;
        use ProcessState as S;

        let next = match (self, event) {
            (S::Stopped | S::Crashed, E::Launch) => S::Starting,
            (S::Starting, E::Handshake) => S::Ready,
            (S::Ready, E::CallStarted) => S::Busy,
            (S::Busy, E::CallFinished) => S::Ready,
            // a call that ends after the process died leaves it dead
            (S::Crashed | S::Stopped, E::CallFinished) => self,
            (S::Stopped, E::Exited) => S::Stopped,
            (_, E::Exited) => S::Crashed,
            (_, E::Stopped) => S::Stopped,
            (state, event) => bail!("invalid process transition: {event:?} while {state}"),
        };
        Ok(next)
    }

    /// A child exists and has not been observed dead.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Busy)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
