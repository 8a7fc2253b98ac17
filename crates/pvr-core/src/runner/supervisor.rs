use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::process::RunnerProcess;
use crate::error::Result;

/// At most one runner per package, plus its timeout streak.
#[derive(Default)]
pub struct ProcessSlot {
    process: Option<RunnerProcess>,
    consecutive_timeouts: u32,
}

impl ProcessSlot {
    /// Returns the live runner, launching a fresh one when there is none or
    /// the previous one died.
    ///
    /// # Errors
    /// Propagates the launcher's startup error.
    pub fn ensure_started<F>(&mut self, launch: F) -> Result<&mut RunnerProcess>
    where
        F: FnOnce() -> Result<RunnerProcess>,
    {
        let process = match self.process.take() {
            Some(process) if process.is_alive() => process,
            stale => {
                if let Some(mut dead) = stale {
                    info!(runner = dead.label(), state = %dead.state(), "replacing dead runner");
                    dead.stop();
                    self.consecutive_timeouts = 0;
                }
                launch()?
            }
        };
        Ok(self.process.insert(process))
    }

    pub fn process(&self) -> Option<&RunnerProcess> {
        self.process.as_ref()
    }

    pub fn process_mut(&mut self) -> Option<&mut RunnerProcess> {
        self.process.as_mut()
    }

    /// Counts a timeout and reports the new streak length.
    pub fn record_timeout(&mut self) -> u32 {
        self.consecutive_timeouts += 1;
        self.consecutive_timeouts
    }

    pub fn reset_timeouts(&mut self) {
        self.consecutive_timeouts = 0;
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Stops the runner gracefully; the next call starts a new one.
    pub fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.stop();
        }
        self.consecutive_timeouts = 0;
    }

    /// Forgets a runner already known to be dead.
    pub fn discard(&mut self) {
        self.stop();
    }
}

/// Runner slots keyed by `name:version`.
///
/// Different packages run concurrently; calls to the same package serialize
/// on the slot's lock.
#[derive(Default)]
pub struct Supervisor {
    slots: Mutex<HashMap<String, Arc<Mutex<ProcessSlot>>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, key: &str) -> Arc<Mutex<ProcessSlot>> {
        lock(&self.slots)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Stops the runner for `key`, waiting for any in-flight call to finish.
    pub fn stop(&self, key: &str) -> bool {
        let Some(slot) = lock(&self.slots).remove(key) else {
            return false;
        };
        let mut slot = lock(&slot);
        let had_process = slot.process().is_some();
        slot.stop();
        if had_process {
            debug!(package = key, "runner stopped by supervisor");
        }
        had_process
    }

    pub fn stop_all(&self) {
        let slots: Vec<(String, Arc<Mutex<ProcessSlot>>)> = lock(&self.slots).drain().collect();
        for (key, slot) in slots {
            lock(&slot).stop();
            debug!(package = %key, "runner stopped");
        }
    }

    /// Keys of packages with a live runner, sorted.
    pub fn running(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<Mutex<ProcessSlot>>)> = lock(&self.slots)
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        let mut running: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.try_lock()
                    .map_or(true, |slot| slot.process().is_some_and(RunnerProcess::is_alive))
            })
            .map(|(key, _)| key)
            .collect();
        running.sort();
        running
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
