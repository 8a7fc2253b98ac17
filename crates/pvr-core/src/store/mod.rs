//! Package store: archive validation, deployment, registry and activations.
//!
//! Layout under the runner root:
//!
//! ```text
//! zips/<name>-<version>.zip        operator drop directory
//! deployed/<name>/<version>/       install directory (+ install.json receipt)
//! registry.json                    name:version -> RegistryEntry
//! active/<pid>.json                pid -> name/version
//! locks/                           per-package and registry locks
//! ```

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pvr_domain::{ActiveMapping, PackageKey, PackageState, RegistryEntry};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::fs::{
    prune_empty_dir, remove_dir_all_writable, timestamp_string, write_json_atomic, RollbackDir,
};
use crate::process::CommandRunner;
use crate::provision::{ProvisionRequest, Provisioner};

mod archive;
mod lock;
mod registry;

pub use archive::ArchiveInspection;

use lock::StoreLock;
use registry::Registry;

pub const RECEIPT_FILE: &str = "install.json";
const REGISTRY_LOCK: &str = "registry.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    Installed,
    AlreadyInstalled,
}

#[derive(Debug, Clone)]
pub struct InstallResult {
    pub entry: RegistryEntry,
    pub outcome: InstallOutcome,
}

pub struct PackageStore {
    config: RunnerConfig,
    runner: Arc<dyn CommandRunner>,
}

impl PackageStore {
    pub fn new(config: RunnerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Checks an archive without extracting it.
    ///
    /// # Errors
    /// See [`archive::inspect`].
    pub fn validate_package(&self, archive_path: &Path) -> Result<ArchiveInspection> {
        archive::inspect(archive_path)
    }

    /// Deploys an archive and provisions its environment. Installing a
    /// package that is already registered and present on disk is a no-op.
    ///
    /// # Errors
    /// Validation and provisioning errors pass through unchanged; anything
    /// else fails with `Install`. No install directory survives a failure.
    pub fn install_package(&self, archive_path: &Path) -> Result<InstallResult> {
        let inspection = archive::inspect(archive_path)?;
        let key = inspection.key.clone();
        let _lock = self.lock_package(&key)?;
        let install_dir = key.install_dir(&self.config.deployed_dir());

        match self.load_registry().get(&key) {
            Some(entry) if install_dir.is_dir() => {
                info!(package = %key, "already installed");
                return Ok(InstallResult {
                    entry: entry.clone(),
                    outcome: InstallOutcome::AlreadyInstalled,
                });
            }
            Some(_) => {
                warn!(package = %key, "registry entry has no install directory; reinstalling");
            }
            None if install_dir.exists() => {
                warn!(
                    package = %key,
                    dir = %install_dir.display(),
                    "removing stale install directory"
                );
                remove_dir_all_writable(&install_dir).map_err(|err| RunnerError::install(&err))?;
            }
            None => {}
        }

        let result = self.deploy(archive_path, &inspection, &install_dir);
        if result.is_err() {
            if let Some(parent) = install_dir.parent() {
                prune_empty_dir(parent);
            }
        }
        let entry = result?;
        info!(
            package = %key,
            interpreter = %entry.environment.source,
            "installed"
        );
        Ok(InstallResult {
            entry,
            outcome: InstallOutcome::Installed,
        })
    }

    fn deploy(
        &self,
        archive_path: &Path,
        inspection: &ArchiveInspection,
        install_dir: &Path,
    ) -> Result<RegistryEntry> {
        let guard = RollbackDir::create(install_dir).map_err(|err| RunnerError::install(&err))?;
        debug!(dir = %install_dir.display(), "extracting");
        archive::extract(archive_path, guard.path()).map_err(|err| RunnerError::install(&err))?;

        let working_dir = inspection.working_dir(install_dir);
        let wheels_dir = install_dir.join(&inspection.wheels_dir);
        let environment = Provisioner::new(&self.config, self.runner.as_ref()).provision(
            &ProvisionRequest {
                install_dir,
                working_dir: &working_dir,
                wheels_dir: &wheels_dir,
                manifest: &inspection.manifest,
                bundled_python: inspection.bundled_python.as_deref(),
            },
        )?;

        let entry = RegistryEntry {
            name: inspection.key.name.clone(),
            version: inspection.key.version.clone(),
            entry_point: inspection.manifest.entry_point.clone(),
            supported_pids: inspection.manifest.supported_pids.clone(),
            status: PackageState::Installed,
            installed_at: timestamp_string().map_err(|err| RunnerError::install(&err))?,
            install_path: install_dir.to_path_buf(),
            working_dir,
            environment_path: environment.path,
            environment: environment.record,
        };
        write_json_atomic(&install_dir.join(RECEIPT_FILE), &entry)
            .map_err(|err| RunnerError::install(&err))?;
        self.update_registry(|registry| registry.insert(entry.clone()))?;
        guard.commit();
        Ok(entry)
    }

    /// Removes an installed package. Returns `false` when nothing was
    /// installed under that name and version, including names that could
    /// never have been installed.
    ///
    /// # Errors
    /// `UnsafeUninstall` while any pid is still mapped to the package;
    /// `Install` when the install directory cannot be removed, in which case
    /// the registry entry is kept.
    pub fn uninstall_package(&self, name: &str, version: &str) -> Result<bool> {
        let Ok(key) = PackageKey::new(name, version) else {
            debug!(name, version, "not a valid package identity; nothing to uninstall");
            return Ok(false);
        };
        let _lock = self.lock_package(&key)?;
        let Some(entry) = self.load_registry().get(&key).cloned() else {
            debug!(package = %key, "not installed");
            return Ok(false);
        };
        let pids = self.active_pids_for(&key);
        if !pids.is_empty() {
            return Err(RunnerError::UnsafeUninstall {
                package: key.to_string(),
                pids,
            });
        }

        remove_dir_all_writable(&entry.install_path).map_err(|err| RunnerError::install(&err))?;
        if let Some(parent) = entry.install_path.parent() {
            prune_empty_dir(parent);
        }
        self.update_registry(|registry| {
            registry.remove(&key);
        })?;
        info!(package = %key, "uninstalled");
        Ok(true)
    }

    pub fn is_installed(&self, name: &str, version: &str) -> bool {
        PackageKey::new(name, version).is_ok_and(|key| self.entry(&key).is_some())
    }

    pub fn list_installed(&self) -> Vec<RegistryEntry> {
        self.load_registry().packages.into_values().collect()
    }

    pub fn entry(&self, key: &PackageKey) -> Option<RegistryEntry> {
        self.load_registry().get(key).cloned()
    }

    /// Maps `pid` to an installed package that declares support for it.
    ///
    /// # Errors
    /// `NotInstalled` for unknown packages, `ActivationConflict` when the
    /// package does not list `pid`.
    pub fn activate(&self, pid: &str, name: &str, version: &str) -> Result<ActiveMapping> {
        validate_pid(pid)?;
        let key = parse_key(name, version)?;
        let entry = self
            .entry(&key)
            .ok_or_else(|| RunnerError::NotInstalled(key.to_string()))?;
        if !entry.supports(pid) {
            return Err(RunnerError::ActivationConflict(format!(
                "{key} does not support pid `{pid}` (supported: {})",
                entry.supported_pids.join(", ")
            )));
        }
        let mapping = ActiveMapping {
            name: key.name.clone(),
            version: key.version.clone(),
            activated_at: timestamp_string().map_err(|err| io_failure(&err))?,
        };
        write_json_atomic(&self.mapping_path(pid), &mapping).map_err(|err| io_failure(&err))?;
        info!(pid, package = %key, "activated");
        Ok(mapping)
    }

    /// Registry entry currently active for `pid`, if any.
    pub fn active_package(&self, pid: &str) -> Option<RegistryEntry> {
        validate_pid(pid).ok()?;
        let mapping = read_mapping(&self.mapping_path(pid))?;
        let entry = self.entry(&mapping.key());
        if entry.is_none() {
            warn!(pid, package = %mapping.key(), "active mapping points at a missing package");
        }
        entry
    }

    /// Drops the mapping for `pid`; `false` when there was none.
    pub fn deactivate(&self, pid: &str) -> Result<bool> {
        validate_pid(pid)?;
        match fs::remove_file(self.mapping_path(pid)) {
            Ok(()) => {
                info!(pid, "deactivated");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn active_mappings(&self) -> Vec<(String, ActiveMapping)> {
        let Ok(entries) = fs::read_dir(self.config.active_dir()) else {
            return Vec::new();
        };
        let mut mappings: Vec<(String, ActiveMapping)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    return None;
                }
                let pid = path.file_stem()?.to_str()?.to_string();
                read_mapping(&path).map(|mapping| (pid, mapping))
            })
            .collect();
        mappings.sort_by(|left, right| left.0.cmp(&right.0));
        mappings
    }

    pub fn active_pids_for(&self, key: &PackageKey) -> Vec<String> {
        self.active_mappings()
            .into_iter()
            .filter(|(_, mapping)| &mapping.key() == key)
            .map(|(pid, _)| pid)
            .collect()
    }

    /// Archives waiting in the drop directory.
    pub fn scan_archives(&self) -> Result<Vec<PathBuf>> {
        let zips = self.config.zips_dir();
        let entries = match fs::read_dir(&zips) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut archives: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
            })
            .collect();
        archives.sort();
        Ok(archives)
    }

    /// Rewrites the registry from the `install.json` receipts on disk.
    pub fn rebuild_registry(&self) -> Result<Vec<RegistryEntry>> {
        let _lock = self.lock_registry()?;
        let mut registry = Registry::empty();
        for receipt in self.receipts() {
            let parsed = fs::read(&receipt)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<RegistryEntry>(&bytes)?));
            match parsed {
                Ok(entry) => {
                    debug!(package = %entry.key(), "recovered from receipt");
                    registry.insert(entry);
                }
                Err(err) => {
                    warn!(receipt = %receipt.display(), error = %err, "skipping unreadable receipt");
                }
            }
        }
        registry
            .save(&self.config.registry_path())
            .map_err(|err| io_failure(&err))?;
        info!(packages = registry.packages.len(), "registry rebuilt");
        Ok(registry.packages.into_values().collect())
    }

    fn receipts(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(names) = fs::read_dir(self.config.deployed_dir()) else {
            return found;
        };
        for name_dir in names.flatten().filter(|entry| entry.path().is_dir()) {
            let Ok(versions) = fs::read_dir(name_dir.path()) else {
                continue;
            };
            for version_dir in versions.flatten().filter(|entry| entry.path().is_dir()) {
                let receipt = version_dir.path().join(RECEIPT_FILE);
                if receipt.is_file() {
                    found.push(receipt);
                } else {
                    warn!(dir = %version_dir.path().display(), "install directory has no receipt");
                }
            }
        }
        found.sort();
        found
    }

    fn load_registry(&self) -> Registry {
        Registry::load(&self.config.registry_path())
    }

    fn update_registry(&self, apply: impl FnOnce(&mut Registry)) -> Result<()> {
        let _lock = self.lock_registry()?;
        let mut registry = self.load_registry();
        apply(&mut registry);
        registry
            .save(&self.config.registry_path())
            .map_err(|err| io_failure(&err))
    }

    fn lock_package(&self, key: &PackageKey) -> Result<StoreLock> {
        lock::acquire(&self.config.locks_dir().join(key.lock_file_name()))
            .map_err(|err| io_failure(&err))
    }

    fn lock_registry(&self) -> Result<StoreLock> {
        lock::acquire(&self.config.locks_dir().join(REGISTRY_LOCK)).map_err(|err| io_failure(&err))
    }

    fn mapping_path(&self, pid: &str) -> PathBuf {
        self.config.active_dir().join(format!("{pid}.json"))
    }
}

fn parse_key(name: &str, version: &str) -> Result<PackageKey> {
    PackageKey::new(name, version).map_err(|err| RunnerError::InvalidPackage(format!("{err:#}")))
}

/// Pids become file names under `active/`.
fn validate_pid(pid: &str) -> Result<()> {
    let valid = !pid.is_empty()
        && !pid.starts_with('.')
        && pid
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RunnerError::InvalidPid {
            pid: pid.to_string(),
        })
    }
}

fn read_mapping(path: &Path) -> Option<ActiveMapping> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(mapping = %path.display(), error = %err, "unreadable activation");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(mapping) => Some(mapping),
        Err(err) => {
            warn!(mapping = %path.display(), error = %err, "corrupt activation ignored");
            None
        }
    }
}

fn io_failure(err: &anyhow::Error) -> RunnerError {
    RunnerError::Io(io::Error::other(format!("{err:#}")))
}

#[cfg(test)]
mod tests;
