//! Command handlers behind the `pvr` front end.
//!
//! Each handler turns typed runner errors into an [`ExecutionOutcome`] so the
//! CLI only has to render it. `Err` is reserved for failures outside the
//! runner's error taxonomy.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pvr_domain::{ImageMeta, PixelFormat, RegistryEntry};
use serde_json::{json, Value};

use crate::call::{ImageFrame, Step};
use crate::engine::RunnerEngine;
use crate::outcome::ExecutionOutcome;
use crate::provision::Environment;
use crate::store::InstallOutcome;

#[derive(Clone, Debug)]
pub struct PackageValidateRequest {
    pub archive: PathBuf,
}

#[derive(Clone, Debug)]
pub struct PackageInstallRequest {
    pub archive: PathBuf,
}

#[derive(Clone, Debug)]
pub struct PackageUninstallRequest {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug)]
pub struct ActivateRequest {
    pub pid: String,
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug)]
pub struct DeactivateRequest {
    pub pid: String,
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub pid: String,
    pub step_index: u32,
    pub step_desc: String,
    /// JSON text; empty means `{}`.
    pub guide_info: Option<String>,
    pub image: PathBuf,
    pub guide: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timeout_ms: Option<u64>,
}

/// Checks an archive without installing it.
///
/// # Errors
/// Never for archive problems; those become user-error outcomes.
pub fn package_validate(
    engine: &RunnerEngine,
    request: &PackageValidateRequest,
) -> Result<ExecutionOutcome> {
    let inspection = match engine.store().validate_package(&request.archive) {
        Ok(inspection) => inspection,
        Err(err) => return Ok(ExecutionOutcome::from_error(&err)),
    };
    let details = json!({
        "name": inspection.key.name,
        "version": inspection.key.version,
        "entry_point": inspection.manifest.entry_point,
        "supported_pids": inspection.manifest.supported_pids,
        "python_version": inspection.manifest.python_version,
        "wheels": inspection.wheels,
        "bundled_python": inspection.bundled_python,
    });
    Ok(ExecutionOutcome::success(
        format!(
            "{} is a valid package ({} wheel(s))",
            inspection.key,
            inspection.wheels.len()
        ),
        details,
    ))
}

/// # Errors
/// Never for install problems; those become outcomes.
pub fn package_install(
    engine: &RunnerEngine,
    request: &PackageInstallRequest,
) -> Result<ExecutionOutcome> {
    let result = match engine.install(&request.archive) {
        Ok(result) => result,
        Err(err) => return Ok(ExecutionOutcome::from_error(&err)),
    };
    let key = result.entry.key();
    let message = match result.outcome {
        InstallOutcome::Installed => format!(
            "installed {key} ({} interpreter)",
            result.entry.environment.source
        ),
        InstallOutcome::AlreadyInstalled => format!("{key} is already installed"),
    };
    let mut details = entry_to_json(&result.entry);
    details["outcome"] = json!(result.outcome);
    Ok(ExecutionOutcome::success(message, details))
}

/// # Errors
/// Never for uninstall problems; those become outcomes.
pub fn package_uninstall(
    engine: &RunnerEngine,
    request: &PackageUninstallRequest,
) -> Result<ExecutionOutcome> {
    let label = format!("{}:{}", request.name, request.version);
    match engine.uninstall(&request.name, &request.version) {
        Ok(true) => Ok(ExecutionOutcome::success(
            format!("removed {label}"),
            json!({ "package": label, "removed": true }),
        )),
        Ok(false) => Ok(ExecutionOutcome::success(
            format!("{label} is not installed"),
            json!({ "package": label, "removed": false }),
        )),
        Err(err) => Ok(ExecutionOutcome::from_error(&err)),
    }
}

/// Installed packages with their environment health and active pids.
///
/// # Errors
/// Does not fail; an unreadable registry lists as empty.
pub fn package_list(engine: &RunnerEngine) -> Result<ExecutionOutcome> {
    let store = engine.store();
    let entries = store.list_installed();
    let details: Vec<Value> = entries
        .iter()
        .map(|entry| {
            let mut value = entry_to_json(entry);
            value["environment_status"] = json!(Environment::for_entry(entry).check());
            value["active_pids"] = json!(store.active_pids_for(&entry.key()));
            value
        })
        .collect();
    if entries.is_empty() {
        return Ok(ExecutionOutcome::success(
            "no packages installed",
            json!({ "packages": details }),
        ));
    }
    let summary = entries
        .iter()
        .map(|entry| {
            let pids = store.active_pids_for(&entry.key());
            if pids.is_empty() {
                format!("{}  {}", entry.key(), entry.entry_point)
            } else {
                format!(
                    "{}  {}  (active: {})",
                    entry.key(),
                    entry.entry_point,
                    pids.join(", ")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(ExecutionOutcome::success(
        format!("installed packages:\n{summary}"),
        json!({ "packages": details }),
    ))
}

/// # Errors
/// Never; an unreadable drop directory becomes a failure outcome.
pub fn package_scan(engine: &RunnerEngine) -> Result<ExecutionOutcome> {
    let archives = match engine.store().scan_archives() {
        Ok(archives) => archives,
        Err(err) => return Ok(ExecutionOutcome::from_error(&err)),
    };
    let store = engine.store();
    let details: Vec<Value> = archives
        .iter()
        .map(|path| {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            match store.validate_package(path) {
                Ok(inspection) => json!({
                    "archive": file_name,
                    "package": inspection.key.to_string(),
                    "valid": true,
                    "installed": store.entry(&inspection.key).is_some(),
                }),
                Err(err) => json!({
                    "archive": file_name,
                    "valid": false,
                    "error": err.to_string(),
                    "code": err.code(),
                }),
            }
        })
        .collect();
    let zips_dir = engine.config().zips_dir();
    Ok(ExecutionOutcome::success(
        format!("{} archive(s) in {}", archives.len(), zips_dir.display()),
        json!({ "zips_dir": zips_dir, "archives": details }),
    ))
}

/// # Errors
/// Never; rebuild failures become outcomes.
pub fn package_rebuild(engine: &RunnerEngine) -> Result<ExecutionOutcome> {
    match engine.store().rebuild_registry() {
        Ok(entries) => Ok(ExecutionOutcome::success(
            format!("registry rebuilt with {} package(s)", entries.len()),
            json!({ "packages": entries.iter().map(entry_to_json).collect::<Vec<_>>() }),
        )),
        Err(err) => Ok(ExecutionOutcome::from_error(&err)),
    }
}

/// # Errors
/// Never; activation problems become outcomes.
pub fn activate(engine: &RunnerEngine, request: &ActivateRequest) -> Result<ExecutionOutcome> {
    match engine.activate(&request.pid, &request.name, &request.version) {
        Ok(mapping) => Ok(ExecutionOutcome::success(
            format!("{} -> {}", request.pid, mapping.key()),
            json!({
                "pid": request.pid,
                "name": mapping.name,
                "version": mapping.version,
                "activated_at": mapping.activated_at,
            }),
        )),
        Err(err) => Ok(ExecutionOutcome::from_error(&err)),
    }
}

/// # Errors
/// Never; a bad pid becomes a user-error outcome.
pub fn deactivate(engine: &RunnerEngine, request: &DeactivateRequest) -> Result<ExecutionOutcome> {
    match engine.deactivate(&request.pid) {
        Ok(removed) => Ok(ExecutionOutcome::success(
            if removed {
                format!("{} deactivated", request.pid)
            } else {
                format!("{} was not active", request.pid)
            },
            json!({ "pid": request.pid, "removed": removed }),
        )),
        Err(err) => Ok(ExecutionOutcome::from_error(&err)),
    }
}

/// Runs one inspection step against raw image files and stops the runner
/// afterwards.
///
/// # Errors
/// Never; unreadable inputs become user-error outcomes.
pub fn run_step(engine: &RunnerEngine, request: &RunRequest) -> Result<ExecutionOutcome> {
    let step = match build_step(request) {
        Ok(step) => step,
        Err(err) => {
            return Ok(ExecutionOutcome::user_error(
                format!("{err:#}"),
                json!({ "pid": request.pid }),
            ))
        }
    };
    let outcome = engine.execute_step(&request.pid, &step);
    engine.shutdown();
    match outcome {
        Ok(result) => {
            let verdict = result.result_status.as_str();
            let message = match &result.ng_reason {
                Some(reason) => format!("{verdict}: {reason}"),
                None => verdict.to_string(),
            };
            Ok(ExecutionOutcome::success(message, json!(result)))
        }
        Err(err) => Ok(ExecutionOutcome::from_error(&err)),
    }
}

fn build_step(request: &RunRequest) -> Result<Step> {
    let guide_info = match request.guide_info.as_deref().map(str::trim) {
        None | Some("") => json!({}),
        Some(raw) => serde_json::from_str(raw).context("--guide-info must be valid JSON")?,
    };
    Ok(Step {
        step_index: request.step_index,
        step_desc: request.step_desc.clone(),
        guide_info,
        current: read_frame(&request.image, request)?,
        guide: read_frame(&request.guide, request)?,
        timeout: request.timeout_ms.map(Duration::from_millis),
    })
}

fn read_frame(path: &Path, request: &RunRequest) -> Result<ImageFrame> {
    let bytes = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let meta = ImageMeta::raw(
        request.width,
        request.height,
        request.format,
        bytes.len() as u64,
    )
    .with_context(|| format!("{} does not match the given dimensions", path.display()))?;
    Ok(ImageFrame { bytes, meta })
}

fn entry_to_json(entry: &RegistryEntry) -> Value {
    json!({
        "name": entry.name,
        "version": entry.version,
        "entry_point": entry.entry_point,
        "supported_pids": entry.supported_pids,
        "status": entry.status,
        "installed_at": entry.installed_at,
        "install_path": entry.install_path,
        "environment_path": entry.environment_path,
        "interpreter": entry.environment.source,
        "python_version": entry.environment.python_version,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::outcome::CommandStatus;
    use crate::test_support::{test_config, ArchiveBuilder, CountingImages, FakeRunner};

    fn engine(root: &std::path::Path) -> RunnerEngine {
        RunnerEngine::new(
            test_config(root),
            Arc::new(FakeRunner::default()),
            Arc::new(CountingImages::default()),
        )
    }

    #[test]
    fn install_list_and_activate_report_details() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine(&temp.path().join("root"));
        let archive = ArchiveBuilder::demo("demo.run", &["P1"])
            .write(&temp.path().join("demo-1.0.0.zip"));

        let installed = package_install(
            &engine,
            &PackageInstallRequest {
                archive: archive.clone(),
            },
        )
        .unwrap();
        assert_eq!(installed.status, CommandStatus::Ok);
        assert_eq!(installed.details["outcome"], "installed");

        let again = package_install(&engine, &PackageInstallRequest { archive }).unwrap();
        assert_eq!(again.details["outcome"], "already_installed");

        let activated = activate(
            &engine,
            &ActivateRequest {
                pid: "P1".into(),
                name: "demo".into(),
                version: "1.0.0".into(),
            },
        )
        .unwrap();
        assert_eq!(activated.status, CommandStatus::Ok);

        let listed = package_list(&engine).unwrap();
        let package = &listed.details["packages"][0];
        assert_eq!(package["name"], "demo");
        assert_eq!(package["active_pids"][0], "P1");
        assert_eq!(package["environment_status"]["status"], "ready");
    }

    #[test]
    fn errors_become_outcomes() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine(&temp.path().join("root"));
        let missing = package_validate(
            &engine,
            &PackageValidateRequest {
                archive: temp.path().join("ghost-1.0.0.zip"),
            },
        )
        .unwrap();
        assert_eq!(missing.status, CommandStatus::UserError);
        assert_eq!(missing.details["code"], "2001");

        let conflict = activate(
            &engine,
            &ActivateRequest {
                pid: "P1".into(),
                name: "demo".into(),
                version: "1.0.0".into(),
            },
        )
        .unwrap();
        assert_eq!(conflict.details["code"], "2008");
    }

    #[test]
    fn run_rejects_mismatched_images_before_calling() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine(&temp.path().join("root"));
        let image = temp.path().join("cur.raw");
        fs::write(&image, [0_u8; 10]).unwrap();
        let request = RunRequest {
            pid: "P1".into(),
            step_index: 0,
            step_desc: "inspect".into(),
            guide_info: Some("{\"roi\": []}".into()),
            image: image.clone(),
            guide: image,
            width: 4,
            height: 4,
            format: PixelFormat::Gray8,
            timeout_ms: None,
        };
        let outcome = run_step(&engine, &request).unwrap();
        assert_eq!(outcome.status, CommandStatus::UserError);
        assert!(outcome.message.contains("does not match"));

        let bad_json = RunRequest {
            guide_info: Some("{oops".into()),
            ..request
        };
        let outcome = run_step(&engine, &bad_json).unwrap();
        assert!(outcome.message.contains("--guide-info"));
    }
}
