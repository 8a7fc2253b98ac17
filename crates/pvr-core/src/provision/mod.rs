//! Offline environment provisioning for installed packages.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use pvr_domain::{
    EnvironmentRecord, EnvironmentStatus, InterpreterSource, Manifest, PythonRequirement,
    RegistryEntry,
};
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::fs::{sha256_file, RollbackDir};
use crate::process::CommandRunner;

pub mod interpreter;
pub(crate) mod requirements;

pub use interpreter::{HostPython, InterpreterChoice, ResolveContext};

use interpreter::{conda_python_spec, detect_conda, detect_host_python, probe_version};
use requirements::{missing_artifacts, parse_requirements};

/// Environment directory inside every install dir.
pub const ENV_DIR_NAME: &str = "venv";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Everything the provisioner needs to know about an extracted package.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub install_dir: &'a Path,
    pub working_dir: &'a Path,
    pub wheels_dir: &'a Path,
    pub manifest: &'a Manifest,
    /// Bundled interpreter, relative to `install_dir`.
    pub bundled_python: Option<&'a str>,
}

/// A provisioned runtime owned by one installed package.
#[derive(Debug, Clone)]
pub struct Environment {
    pub path: PathBuf,
    pub requirements: PathBuf,
    pub record: EnvironmentRecord,
}

impl Environment {
    pub fn for_entry(entry: &RegistryEntry) -> Self {
        Self {
            path: entry.environment_path.clone(),
            requirements: entry.working_dir.join(REQUIREMENTS_FILE),
            record: entry.environment.clone(),
        }
    }

    pub fn python(&self) -> &Path {
        &self.record.python
    }

    pub fn check(&self) -> EnvironmentStatus {
        if !self.record.python.is_file() {
            return EnvironmentStatus::Broken(format!(
                "interpreter missing at {}",
                self.record.python.display()
            ));
        }
        match sha256_file(&self.requirements) {
            Ok(hash) if hash == self.record.requirements_hash => EnvironmentStatus::Ready,
            Ok(_) => EnvironmentStatus::Broken(format!(
                "{} changed since the environment was provisioned",
                self.requirements.display()
            )),
            Err(err) => EnvironmentStatus::Broken(format!("{err:#}")),
        }
    }
}

pub struct Provisioner<'a> {
    config: &'a RunnerConfig,
    runner: &'a dyn CommandRunner,
}

impl<'a> Provisioner<'a> {
    pub fn new(config: &'a RunnerConfig, runner: &'a dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    /// Builds `<install_dir>/venv` and installs `requirements.txt` from the
    /// bundled wheels without touching the network.
    ///
    /// # Errors
    /// `IncompatiblePython` when no interpreter can be resolved, `Provision`
    /// for missing wheels or failing tools. The environment directory is
    /// removed on every error path.
    pub fn provision(&self, request: &ProvisionRequest<'_>) -> Result<Environment> {
        let requirements_path = request.working_dir.join(REQUIREMENTS_FILE);
        let contents = fs::read_to_string(&requirements_path)
            .with_context(|| format!("failed to read {}", requirements_path.display()))
            .map_err(|err| RunnerError::provision(&err))?;
        let requirements =
            parse_requirements(&contents).map_err(|err| RunnerError::provision(&err))?;
        let artifacts = list_artifacts(request.wheels_dir);

        let missing = missing_artifacts(&requirements, &artifacts);
        if !missing.is_empty() {
            let listed = missing
                .iter()
                .map(|req| format!("{} (line {})", req.raw, req.line))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(RunnerError::Provision(format!(
                "no bundled wheel satisfies: {listed}"
            )));
        }

        let requirement = request.manifest.python_requirement().or_else(|| {
            PythonRequirement::from_wheel_names(artifacts.iter().map(String::as_str))
        });
        let host = self.probe_host(request.install_dir);
        let conda = requirement
            .as_ref()
            .and_then(|_| detect_conda(self.config.conda.as_deref()));
        let ctx = ResolveContext {
            install_dir: request.install_dir,
            bundled: request.bundled_python,
            requirement: requirement.as_ref(),
            host: host.as_ref(),
            conda: conda.as_deref(),
        };
        let choice = interpreter::resolve(&ctx).ok_or_else(|| {
            RunnerError::IncompatiblePython(match &requirement {
                Some(req) => format!("package needs python {req}; no bundled runtime, conda, or host interpreter is available"),
                None => "no bundled runtime and no host interpreter found".to_string(),
            })
        })?;
        if let (InterpreterSource::Host, Some(req), Some(version)) =
            (choice.source, requirement.as_ref(), choice.version.as_deref())
        {
            if !interpreter::satisfies(req, version) {
                warn!(
                    required = %req,
                    host = version,
                    "host python does not match the package requirement; continuing"
                );
            }
        }
        info!(
            source = %choice.source,
            program = %choice.program.display(),
            "creating environment"
        );

        let env_dir = request.install_dir.join(ENV_DIR_NAME);
        let guard = RollbackDir::watch(&env_dir);
        self.create_env(&choice, &env_dir, request.install_dir)?;
        let python = env_python(&env_dir, choice.source);
        if !python.is_file() {
            return Err(RunnerError::Provision(format!(
                "environment interpreter missing at {}",
                python.display()
            )));
        }

        if requirements.is_empty() {
            debug!("no requirements to install");
        } else {
            self.pip_install(&python, request, &requirements_path)?;
        }

        let python_version = match probe_version(self.runner, &python, request.working_dir) {
            Ok(version) => Some(version),
            Err(err) => {
                debug!(error = %format!("{err:#}"), "could not probe environment python");
                choice.version.clone()
            }
        };
        let requirements_hash =
            sha256_file(&requirements_path).map_err(|err| RunnerError::provision(&err))?;
        guard.commit();

        Ok(Environment {
            path: env_dir,
            requirements: requirements_path,
            record: EnvironmentRecord {
                source: choice.source,
                base_interpreter: choice.program,
                python,
                python_version,
                requirements_hash,
            },
        })
    }

    fn probe_host(&self, cwd: &Path) -> Option<HostPython> {
        let path = match detect_host_python(self.config.python.as_deref()) {
            Ok(path) => path,
            Err(err) => {
                debug!(error = %err, "no host python");
                return None;
            }
        };
        match probe_version(self.runner, &path, cwd) {
            Ok(version) => Some(HostPython { path, version }),
            Err(err) => {
                warn!(python = %path.display(), error = %format!("{err:#}"), "ignoring unusable host python");
                None
            }
        }
    }

    fn create_env(&self, choice: &InterpreterChoice, env_dir: &Path, cwd: &Path) -> Result<()> {
        let env_arg = env_dir.display().to_string();
        let args: Vec<String> = match choice.source {
            InterpreterSource::Conda => {
                let spec = conda_python_spec(choice.version.as_deref().unwrap_or_default());
                vec![
                    "create".into(),
                    "-p".into(),
                    env_arg,
                    spec,
                    "-y".into(),
                    "--offline".into(),
                ]
            }
            InterpreterSource::Bundled | InterpreterSource::Host => {
                vec!["-m".into(), "venv".into(), env_arg]
            }
        };
        let output = self
            .runner
            .run(&choice.program, &args, cwd)
            .map_err(|err| RunnerError::provision(&err))?;
        if !output.success() {
            return Err(RunnerError::Provision(format!(
                "{} environment creation failed (exit {}): {}",
                choice.source,
                output.code,
                output.tail(10)
            )));
        }
        Ok(())
    }

    fn pip_install(
        &self,
        python: &Path,
        request: &ProvisionRequest<'_>,
        requirements_path: &Path,
    ) -> Result<()> {
        let args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--no-index".to_string(),
            "--find-links".to_string(),
            request.wheels_dir.display().to_string(),
            "-r".to_string(),
            requirements_path.display().to_string(),
        ];
        let output = self
            .runner
            .run(python, &args, request.working_dir)
            .map_err(|err| RunnerError::provision(&err))?;
        if !output.success() {
            return Err(RunnerError::Provision(format!(
                "offline dependency install failed (exit {}): {}",
                output.code,
                output.tail(10)
            )));
        }
        Ok(())
    }
}

/// Interpreter path inside a created environment.
pub fn env_python(env_dir: &Path, source: InterpreterSource) -> PathBuf {
    if cfg!(windows) {
        match source {
            InterpreterSource::Conda => env_dir.join("python.exe"),
            _ => env_dir.join("Scripts").join("python.exe"),
        }
    } else {
        env_dir.join("bin").join("python")
    }
}

fn list_artifacts(wheels_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(wheels_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}
