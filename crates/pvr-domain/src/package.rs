//! Package identity and manifest model.
//!
//! A package is identified by `(name, version)`, both taken from the archive
//! file name (`<name>-<version>.zip`). The manifest inside the archive may
//! repeat them, in which case they must agree.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageKey {
    pub name: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        validate_segment("name", &name)?;
        validate_segment("version", &version)?;
        if !version.starts_with(|ch: char| ch.is_ascii_digit()) {
            bail!("package version `{version}` must start with a digit");
        }
        Ok(Self { name, version })
    }

    /// Parses `<name>-<version>.zip`, splitting at the rightmost hyphen whose
    /// tail looks like a version. A `v` prefix on the version is dropped.
    pub fn from_archive_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("archive path {} has no file name", path.display()))?;
        let stem = file_name
            .len()
            .checked_sub(4)
            .filter(|idx| file_name.is_char_boundary(*idx))
            .filter(|idx| file_name[*idx..].eq_ignore_ascii_case(".zip"))
            .map(|idx| &file_name[..idx])
            .ok_or_else(|| anyhow!("archive `{file_name}` must be a .zip file"))?;

        for (idx, _) in stem.match_indices('-').rev() {
            let (name, tail) = (&stem[..idx], &stem[idx + 1..]);
            let version = tail
                .strip_prefix(['v', 'V'])
                .filter(|rest| rest.starts_with(|ch: char| ch.is_ascii_digit()))
                .unwrap_or(tail);
            if name.is_empty() || !version.starts_with(|ch: char| ch.is_ascii_digit()) {
                continue;
            }
            return Self::new(name, version)
                .with_context(|| format!("archive `{file_name}` has an invalid name"));
        }
        bail!("archive `{file_name}` does not match the `<name>-<version>.zip` pattern")
    }

    /// Key used in the registry file and for process bookkeeping.
    pub fn registry_key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    pub fn install_dir(&self, deployed_root: &Path) -> PathBuf {
        deployed_root.join(&self.name).join(&self.version)
    }

    pub fn lock_file_name(&self) -> String {
        format!("{}-{}.lock", self.name, self.version)
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

fn validate_segment(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("package {label} must not be empty");
    }
    if value.starts_with('.') {
        bail!("package {label} `{value}` must not start with '.'");
    }
    if let Some(bad) = value
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')))
    {
        bail!("package {label} `{value}` contains unsupported character {bad:?}");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub entry_point: String,
    pub supported_pids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest =
            serde_json::from_slice(bytes).context("manifest.json is not a valid manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_point.trim().is_empty() {
            bail!("manifest entry_point must not be empty");
        }
        if self.supported_pids.is_empty() {
            bail!("manifest supported_pids must list at least one pid");
        }
        if self.supported_pids.iter().any(|pid| pid.trim().is_empty()) {
            bail!("manifest supported_pids must not contain empty ids");
        }
        if let Some(raw) = &self.python_version {
            PythonRequirement::parse(raw)?;
        }
        Ok(())
    }

    /// Rejects manifests whose declared identity disagrees with the archive name.
    pub fn check_identity(&self, key: &PackageKey) -> Result<()> {
        if let Some(name) = &self.name {
            if name != &key.name {
                bail!("manifest name `{name}` does not match archive name `{}`", key.name);
            }
        }
        if let Some(version) = &self.version {
            let version = version.strip_prefix(['v', 'V']).unwrap_or(version);
            if version != key.version {
                bail!(
                    "manifest version `{version}` does not match archive version `{}`",
                    key.version
                );
            }
        }
        Ok(())
    }

    pub fn supports(&self, pid: &str) -> bool {
        self.supported_pids.iter().any(|candidate| candidate == pid)
    }

    pub fn python_requirement(&self) -> Option<PythonRequirement> {
        self.python_version
            .as_deref()
            .and_then(|raw| PythonRequirement::parse(raw).ok())
    }
}

/// Interpreter version a package asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PythonRequirement {
    /// `major.minor`, e.g. `3.10`.
    Channel { major: u64, minor: u64 },
    /// A PEP 440 specifier set such as `>=3.9,<3.13`.
    Specifier(String),
}

impl PythonRequirement {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("python_version must not be empty");
        }
        if trimmed.starts_with(['<', '>', '=', '!', '~']) {
            return Ok(Self::Specifier(trimmed.to_string()));
        }
        let (major, minor) = parse_channel(trimmed)
            .with_context(|| format!("invalid python_version `{trimmed}`"))?;
        Ok(Self::Channel { major, minor })
    }

    /// Infers the channel from the most common `cpXY` tag across wheel file
    /// names. Ties go to the newer channel.
    pub fn from_wheel_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut counts: HashMap<(u64, u64), usize> = HashMap::new();
        for name in names {
            if !name.ends_with(".whl") {
                continue;
            }
            let Some(tag) = name.split('-').find_map(|part| {
                part.strip_prefix("cp")
                    .filter(|tag| tag.len() >= 2 && tag.chars().all(|ch| ch.is_ascii_digit()))
            }) else {
                continue;
            };
            let (major, minor) = tag.split_at(1);
            let (Ok(major), Ok(minor)) = (major.parse::<u64>(), minor.parse::<u64>()) else {
                continue;
            };
            *counts.entry((major, minor)).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by(|(left, lc), (right, rc)| lc.cmp(rc).then(left.cmp(right)))
            .map(|((major, minor), _)| Self::Channel { major, minor })
    }
}

impl fmt::Display for PythonRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel { major, minor } => write!(f, "{major}.{minor}"),
            Self::Specifier(spec) => f.write_str(spec),
        }
    }
}

/// Parses the `major.minor` prefix of a version string like `3.10.12`.
pub fn parse_channel(input: &str) -> Result<(u64, u64)> {
    let mut parts = input.split('.');
    let major = parts
        .next()
        .ok_or_else(|| anyhow!("python version missing major"))?
        .parse::<u64>()?;
    let minor = parts
        .next()
        .ok_or_else(|| anyhow!("python version missing minor"))?
        .parse::<u64>()?;
    Ok((major, minor))
}
