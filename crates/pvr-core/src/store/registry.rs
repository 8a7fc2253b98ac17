use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use pvr_domain::{PackageKey, RegistryEntry};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fs::write_json_atomic;

const REGISTRY_VERSION: u32 = 1;

/// On-disk `registry.json`, keyed by `name:version`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Registry {
    #[serde(default = "registry_version")]
    pub version: u32,
    #[serde(default)]
    pub packages: BTreeMap<String, RegistryEntry>,
}

fn registry_version() -> u32 {
    REGISTRY_VERSION
}

impl Registry {
    /// Loads the registry; a missing file is empty and a corrupt one is
    /// treated as empty after a warning.
    pub(crate) fn load(path: &Path) -> Self {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Self::empty(),
            Err(err) => {
                warn!(registry = %path.display(), error = %err, "registry unreadable; treating as empty");
                return Self::empty();
            }
        };
        match serde_json::from_slice::<Registry>(&contents) {
            Ok(registry) => registry,
            Err(err) => {
                warn!(
                    registry = %path.display(),
                    error = %err,
                    "registry is corrupt; treating as empty (run `pvr package rebuild` to recover)"
                );
                Self::empty()
            }
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            version: REGISTRY_VERSION,
            packages: BTreeMap::new(),
        }
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
            .with_context(|| format!("failed to write registry {}", path.display()))
    }

    pub(crate) fn get(&self, key: &PackageKey) -> Option<&RegistryEntry> {
        self.packages.get(&key.registry_key())
    }

    pub(crate) fn insert(&mut self, entry: RegistryEntry) {
        self.packages.insert(entry.key().registry_key(), entry);
    }

    pub(crate) fn remove(&mut self, key: &PackageKey) -> Option<RegistryEntry> {
        self.packages.remove(&key.registry_key())
    }
}
