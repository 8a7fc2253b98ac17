use std::path::Path;
use std::sync::Arc;

use pvr_domain::{ActiveMapping, CallResult, EnvironmentStatus, PackageKey, RegistryEntry};
use tracing::{debug, info, warn};

use crate::call::{CallEngine, Step};
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::process::{CommandRunner, SystemCommandRunner};
use crate::provision::Environment;
use crate::runner::{lock, LaunchSpec, ProcessOptions, RunnerProcess, Supervisor};
use crate::shm::{FileShmChannel, ImageChannel};
use crate::store::{InstallResult, PackageStore};

/// Ties the store, the supervisor and the call engine together for callers
/// that think in pids rather than packages.
pub struct RunnerEngine {
    config: RunnerConfig,
    store: PackageStore,
    images: Arc<dyn ImageChannel>,
    supervisor: Supervisor,
}

impl RunnerEngine {
    pub fn new(
        config: RunnerConfig,
        runner: Arc<dyn CommandRunner>,
        images: Arc<dyn ImageChannel>,
    ) -> Self {
        Self {
            store: PackageStore::new(config.clone(), runner),
            config,
            images,
            supervisor: Supervisor::new(),
        }
    }

    /// Real tools and file-backed segments in the configured shm directory.
    pub fn system(config: RunnerConfig) -> Self {
        let images = Arc::new(FileShmChannel::new(config.shm_dir.clone()));
        Self::new(config, Arc::new(SystemCommandRunner), images)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    /// Runs one inspection step with the package active for `pid`.
    ///
    /// The package's runner is started on first use and reused afterwards.
    /// Calls for the same package queue behind each other.
    ///
    /// # Errors
    /// `InvalidPid` without an active package, `Provision` when the
    /// environment is broken, then anything from startup or the call itself.
    pub fn execute_step(&self, pid: &str, step: &Step) -> Result<CallResult> {
        let entry = self
            .store
            .active_package(pid)
            .ok_or_else(|| RunnerError::InvalidPid {
                pid: pid.to_string(),
            })?;
        let key = entry.key().registry_key();
        if let EnvironmentStatus::Broken(reason) = Environment::for_entry(&entry).check() {
            return Err(RunnerError::Provision(format!(
                "environment for {key} is broken: {reason}; reinstall the package"
            )));
        }

        let slot = self.supervisor.slot(&key);
        let mut slot = lock(&slot);
        let launch = LaunchSpec::for_entry(&entry, &self.config);
        let options = ProcessOptions::from_config(&self.config);
        let process = slot.ensure_started(|| RunnerProcess::start(&key, &launch, options))?;
        if let Err(err) = process.begin_call() {
            slot.discard();
            return Err(err);
        }
        let timeout = step.timeout.unwrap_or(self.config.execute_timeout);
        let outcome =
            CallEngine::new(self.images.as_ref()).execute(process, Some(pid), step, timeout);
        process.end_call();

        match &outcome {
            Ok(result) => {
                slot.reset_timeouts();
                debug!(pid, package = %key, verdict = result.result_status.as_str(), "step finished");
            }
            Err(RunnerError::CallTimeout { .. }) => {
                let streak = slot.record_timeout();
                let limit = self.config.max_consecutive_timeouts;
                if limit > 0 && streak >= limit {
                    warn!(package = %key, streak, "restarting runner after repeated timeouts");
                    slot.stop();
                }
            }
            Err(RunnerError::ProcessCrashed(_)) => slot.discard(),
            Err(_) => {}
        }
        outcome
    }

    /// # Errors
    /// See [`PackageStore::install_package`].
    pub fn install(&self, archive: &Path) -> Result<InstallResult> {
        self.store.install_package(archive)
    }

    /// Stops the package's runner, then removes the package.
    ///
    /// # Errors
    /// See [`PackageStore::uninstall_package`]; the runner keeps running when
    /// the uninstall is refused.
    pub fn uninstall(&self, name: &str, version: &str) -> Result<bool> {
        if let Ok(key) = PackageKey::new(name, version) {
            if self.store.active_pids_for(&key).is_empty()
                && self.supervisor.stop(&key.registry_key())
            {
                info!(package = %key, "stopped runner before uninstall");
            }
        }
        self.store.uninstall_package(name, version)
    }

    /// # Errors
    /// See [`PackageStore::activate`].
    pub fn activate(&self, pid: &str, name: &str, version: &str) -> Result<ActiveMapping> {
        let previous = self.store.active_package(pid);
        let mapping = self.store.activate(pid, name, version)?;
        if let Some(previous) = previous {
            self.stop_if_unused(&previous);
        }
        Ok(mapping)
    }

    /// Drops the mapping for `pid` and stops the runner once no pid uses it.
    ///
    /// # Errors
    /// See [`PackageStore::deactivate`].
    pub fn deactivate(&self, pid: &str) -> Result<bool> {
        let previous = self.store.active_package(pid);
        let removed = self.store.deactivate(pid)?;
        if let Some(previous) = previous {
            self.stop_if_unused(&previous);
        }
        Ok(removed)
    }

    /// Packages with a live runner.
    pub fn running(&self) -> Vec<String> {
        self.supervisor.running()
    }

    pub fn shutdown(&self) {
        self.supervisor.stop_all();
    }

    fn stop_if_unused(&self, entry: &RegistryEntry) {
        let key = entry.key();
        if self.store.active_pids_for(&key).is_empty() && self.supervisor.stop(&key.registry_key()) {
            debug!(package = %key, "stopped runner with no active pids");
        }
    }
}
