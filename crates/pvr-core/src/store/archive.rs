//! Reading package archives without trusting them.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use pvr_domain::{Manifest, PackageKey};
use tracing::debug;
use zip::ZipArchive;

use crate::error::RunnerError;

const MANIFEST_FILE: &str = "manifest.json";
const REQUIREMENTS_FILE: &str = "requirements.txt";
const WHEELS_DIR: &str = "wheels";
const INTERPRETER_NAMES: [&str; 3] = ["python", "python3", "python.exe"];
const RUNTIME_DIR_HINTS: [&str; 4] = ["python_embed", "python-embed", "runtime", "python"];
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// What [`inspect`] learned about an archive.
#[derive(Debug, Clone)]
pub struct ArchiveInspection {
    pub key: PackageKey,
    pub manifest: Manifest,
    /// Top-level directory holding `manifest.json`, when not at the root.
    pub root_prefix: Option<String>,
    /// Wheel and sdist file names under `wheels/`.
    pub wheels: Vec<String>,
    /// In-archive path of the `wheels/` directory.
    pub wheels_dir: String,
    /// In-archive path of a bundled interpreter executable.
    pub bundled_python: Option<String>,
}

impl ArchiveInspection {
    /// Directory `manifest.json` ends up in once extracted.
    pub fn working_dir(&self, install_dir: &Path) -> PathBuf {
        match &self.root_prefix {
            Some(prefix) => install_dir.join(prefix),
            None => install_dir.to_path_buf(),
        }
    }
}

/// Validates an archive by reading its directory and manifest only.
///
/// # Errors
/// `InvalidPackage` for bad names and layouts, `Manifest` for a missing or
/// malformed manifest, `WheelsMissing` when requirements are declared but no
/// `wheels/` directory ships with them.
pub fn inspect(path: &Path) -> Result<ArchiveInspection, RunnerError> {
    let key = PackageKey::from_archive_path(path)
        .map_err(|err| RunnerError::InvalidPackage(format!("{err:#}")))?;
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))
        .map_err(|err| RunnerError::InvalidPackage(format!("{err:#}")))?;
    let mut archive = ZipArchive::new(file).map_err(|err| {
        RunnerError::InvalidPackage(format!("{} is not a readable zip: {err}", path.display()))
    })?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();

    let manifest_path = locate_manifest(&names)?;
    let root_prefix = manifest_path
        .strip_suffix(MANIFEST_FILE)
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string);
    let prefix = root_prefix.as_deref().unwrap_or("");

    let manifest_bytes = read_entry(&mut archive, &manifest_path, MAX_MANIFEST_BYTES)
        .map_err(|err| RunnerError::Manifest(format!("{err:#}")))?;
    let manifest =
        Manifest::parse(&manifest_bytes).map_err(|err| RunnerError::Manifest(format!("{err:#}")))?;
    manifest
        .check_identity(&key)
        .map_err(|err| RunnerError::InvalidPackage(format!("{err:#}")))?;

    let requirements_path = format!("{prefix}{REQUIREMENTS_FILE}");
    if !names.iter().any(|name| name == &requirements_path) {
        return Err(RunnerError::InvalidPackage(format!(
            "archive is missing {requirements_path}"
        )));
    }
    let requirements = read_entry(&mut archive, &requirements_path, MAX_MANIFEST_BYTES)
        .map_err(|err| RunnerError::InvalidPackage(format!("{err:#}")))?;

    let wheels_dir = format!("{prefix}{WHEELS_DIR}");
    let wheels_prefix = format!("{wheels_dir}/");
    let has_wheels_dir = names.iter().any(|name| name.starts_with(&wheels_prefix));
    let wheels: Vec<String> = names
        .iter()
        .filter_map(|name| name.strip_prefix(&wheels_prefix))
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(str::to_string)
        .collect();
    let declares_requirements = String::from_utf8_lossy(&requirements)
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with('#'));
    if declares_requirements && !has_wheels_dir {
        return Err(RunnerError::WheelsMissing(format!(
            "{requirements_path} lists dependencies but {wheels_prefix} is absent"
        )));
    }

    let bundled_python = find_bundled_interpreter(&names, &wheels_prefix);
    if let Some(found) = &bundled_python {
        debug!(interpreter = %found, "archive bundles a runtime");
    }

    Ok(ArchiveInspection {
        key,
        manifest,
        root_prefix,
        wheels,
        wheels_dir,
        bundled_python,
    })
}

/// `manifest.json` at the root, or inside exactly one top-level directory.
fn locate_manifest(names: &[String]) -> Result<String, RunnerError> {
    if names.iter().any(|name| name == MANIFEST_FILE) {
        return Ok(MANIFEST_FILE.to_string());
    }
    let nested: Vec<&String> = names
        .iter()
        .filter(|name| {
            name.split_once('/')
                .is_some_and(|(dir, rest)| !dir.is_empty() && rest == MANIFEST_FILE)
        })
        .collect();
    match nested.as_slice() {
        [] => Err(RunnerError::Manifest(
            "manifest.json not found at the archive root or in a top-level directory".into(),
        )),
        [only] => {
            let top_levels = top_level_dirs(names);
            if top_levels.len() > 1 {
                return Err(RunnerError::InvalidPackage(format!(
                    "manifest lives in {only} but the archive has {} top-level entries",
                    top_levels.len()
                )));
            }
            Ok((*only).clone())
        }
        several => Err(RunnerError::InvalidPackage(format!(
            "archive contains {} candidate manifests",
            several.len()
        ))),
    }
}

fn top_level_dirs(names: &[String]) -> Vec<&str> {
    let mut dirs: Vec<&str> = names
        .iter()
        .map(|name| name.split('/').next().unwrap_or_default())
        .filter(|dir| !dir.is_empty())
        .collect();
    dirs.sort_unstable();
    dirs.dedup();
    dirs
}

/// Shallowest executable named like an interpreter, outside `wheels/`. An
/// interpreter in a conventionally named runtime directory wins ties.
fn find_bundled_interpreter(names: &[String], wheels_prefix: &str) -> Option<String> {
    names
        .iter()
        .filter(|name| !name.starts_with(wheels_prefix) && !name.ends_with('/'))
        .filter_map(|name| {
            let (dir, file) = name.rsplit_once('/')?;
            INTERPRETER_NAMES.contains(&file).then_some((dir, name))
        })
        .min_by_key(|(dir, name)| {
            let hinted = dir
                .split('/')
                .any(|segment| RUNTIME_DIR_HINTS.contains(&segment.to_ascii_lowercase().as_str()));
            (name.matches('/').count(), !hinted, name.len())
        })
        .map(|(_, name)| name.clone())
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str, limit: u64) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|err| anyhow!("failed to read {name}: {err}"))?;
    if entry.size() > limit {
        bail!("{name} is larger than {limit} bytes");
    }
    let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
    entry.take(limit).read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Extracts every entry below `dest`. Entries escaping `dest` abort the
/// extraction.
pub(crate) fn extract(path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("{} is not a readable zip", path.display()))?;
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        let Some(enclosed) = entry.enclosed_name().map(|rel| dest.join(rel)) else {
            bail!("archive entry `{}` escapes the install directory", entry.name());
        };
        if entry.name().ends_with('/') || entry.is_dir() {
            fs::create_dir_all(&enclosed)
                .with_context(|| format!("failed to create {}", enclosed.display()))?;
            continue;
        }
        if let Some(parent) = enclosed.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut outfile = File::create(&enclosed)
            .with_context(|| format!("failed to create {}", enclosed.display()))?;
        io::copy(&mut entry, &mut outfile)
            .with_context(|| format!("failed to write {}", enclosed.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&enclosed, fs::Permissions::from_mode(mode | 0o600))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ArchiveBuilder;

    #[test]
    fn minimal_archive_inspects() {
        let temp = tempfile::tempdir().unwrap();
        let path = ArchiveBuilder::demo("demo.run", &["P1"]).write(&temp.path().join("demo-1.0.0.zip"));
        let inspection = inspect(&path).unwrap();
        assert_eq!(inspection.key.registry_key(), "demo:1.0.0");
        assert_eq!(inspection.manifest.entry_point, "demo.run");
        assert!(inspection.root_prefix.is_none());
        assert!(inspection.wheels.is_empty());
        assert!(inspection.bundled_python.is_none());
    }

    #[test]
    fn nested_layout_and_bundled_runtime() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = br#"{"name":"demo","version":"2.0","entry_point":"demo.main","supported_pids":["A"]}"#;
        let path = ArchiveBuilder::new()
            .file("demo/manifest.json", manifest)
            .file("demo/requirements.txt", b"six==1.16.0\n")
            .file("demo/wheels/six-1.16.0-py2.py3-none-any.whl", b"whl")
            .file("demo/tools/helper/python", b"#!")
            .file("demo/python_embed/python.exe", b"MZ")
            .write(&temp.path().join("demo-v2.0.zip"));
        let inspection = inspect(&path).unwrap();
        assert_eq!(inspection.root_prefix.as_deref(), Some("demo/"));
        assert_eq!(inspection.wheels_dir, "demo/wheels");
        assert_eq!(inspection.wheels, vec!["six-1.16.0-py2.py3-none-any.whl"]);
        assert_eq!(
            inspection.bundled_python.as_deref(),
            Some("demo/python_embed/python.exe")
        );
        assert_eq!(
            inspection.working_dir(Path::new("/i")),
            PathBuf::from("/i/demo/")
        );
    }

    #[test]
    fn rejects_bad_archives() {
        let temp = tempfile::tempdir().unwrap();
        let no_manifest = ArchiveBuilder::new()
            .file("requirements.txt", b"")
            .write(&temp.path().join("demo-1.0.zip"));
        assert_eq!(inspect(&no_manifest).unwrap_err().code(), "2002");

        let bad_name = ArchiveBuilder::demo("demo.run", &["P1"]).write(&temp.path().join("demo.zip"));
        assert_eq!(inspect(&bad_name).unwrap_err().code(), "2001");

        let no_requirements = ArchiveBuilder::new()
            .file("manifest.json", br#"{"entry_point":"x","supported_pids":["P1"]}"#)
            .write(&temp.path().join("demo-1.1.zip"));
        assert_eq!(inspect(&no_requirements).unwrap_err().code(), "2001");

        let no_wheels = ArchiveBuilder::new()
            .file("manifest.json", br#"{"entry_point":"x","supported_pids":["P1"]}"#)
            .file("requirements.txt", b"numpy==2.2.6\n")
            .write(&temp.path().join("demo-1.2.zip"));
        assert_eq!(inspect(&no_wheels).unwrap_err().code(), "2004");

        let mismatched = ArchiveBuilder::new()
            .file(
                "manifest.json",
                br#"{"name":"other","entry_point":"x","supported_pids":["P1"]}"#,
            )
            .file("requirements.txt", b"")
            .write(&temp.path().join("demo-1.3.zip"));
        assert_eq!(inspect(&mismatched).unwrap_err().code(), "2001");

        let garbage = temp.path().join("demo-1.4.zip");
        fs::write(&garbage, b"not a zip").unwrap();
        assert_eq!(inspect(&garbage).unwrap_err().code(), "2001");
    }

    #[test]
    fn extraction_refuses_escaping_entries() {
        let temp = tempfile::tempdir().unwrap();
        let path = ArchiveBuilder::demo("demo.run", &["P1"])
            .file("../evil.txt", b"x")
            .write(&temp.path().join("demo-1.0.0.zip"));
        let dest = temp.path().join("out");
        let err = extract(&path, &dest).unwrap_err();
        assert!(err.to_string().contains("escapes"));
        assert!(!temp.path().join("evil.txt").exists());
    }
}
