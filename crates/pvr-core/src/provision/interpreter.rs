//! Interpreter resolution.
//!
//! Each resolver is a pure function over a [`ResolveContext`] that the
//! provisioner fills in up front (host probe, conda lookup). They are tried in
//! [`RESOLVERS`] order and the first hit wins.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use pep440_rs::{Version, VersionSpecifiers};
use pvr_domain::{parse_channel, InterpreterSource, PythonRequirement};
use which::which;

use crate::process::CommandRunner;

const VERSION_SCRIPT: &str =
    "import sys; print('%d.%d.%d' % sys.version_info[:3])";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPython {
    pub path: PathBuf,
    /// Full `major.minor.patch` version.
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
    pub install_dir: &'a Path,
    /// In-archive path of a bundled interpreter, relative to the install dir.
    pub bundled: Option<&'a str>,
    pub requirement: Option<&'a PythonRequirement>,
    pub host: Option<&'a HostPython>,
    pub conda: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterChoice {
    pub source: InterpreterSource,
    /// Interpreter (or conda executable) used to create the environment.
    pub program: PathBuf,
    /// Known or requested version, when there is one.
    pub version: Option<String>,
}

pub type Resolver = fn(&ResolveContext<'_>) -> Option<InterpreterChoice>;

pub const RESOLVERS: [Resolver; 3] = [resolve_bundled, resolve_conda, resolve_host];

pub fn resolve(ctx: &ResolveContext<'_>) -> Option<InterpreterChoice> {
    RESOLVERS.iter().find_map(|resolver| resolver(ctx))
}

pub fn resolve_bundled(ctx: &ResolveContext<'_>) -> Option<InterpreterChoice> {
    let relative = ctx.bundled?;
    Some(InterpreterChoice {
        source: InterpreterSource::Bundled,
        program: ctx.install_dir.join(relative),
        version: None,
    })
}

/// Conda is only worth it when the package pins a version the host lacks.
pub fn resolve_conda(ctx: &ResolveContext<'_>) -> Option<InterpreterChoice> {
    let requirement = ctx.requirement?;
    let conda = ctx.conda?;
    if ctx
        .host
        .is_some_and(|host| satisfies(requirement, &host.version))
    {
        return None;
    }
    Some(InterpreterChoice {
        source: InterpreterSource::Conda,
        program: conda.to_path_buf(),
        version: Some(requirement.to_string()),
    })
}

pub fn resolve_host(ctx: &ResolveContext<'_>) -> Option<InterpreterChoice> {
    let host = ctx.host?;
    Some(InterpreterChoice {
        source: InterpreterSource::Host,
        program: host.path.clone(),
        version: Some(host.version.clone()),
    })
}

pub fn satisfies(requirement: &PythonRequirement, version: &str) -> bool {
    match requirement {
        PythonRequirement::Channel { major, minor } => {
            parse_channel(version).is_ok_and(|channel| channel == (*major, *minor))
        }
        PythonRequirement::Specifier(spec) => {
            match (VersionSpecifiers::from_str(spec), Version::from_str(version)) {
                (Ok(specs), Ok(version)) => specs.contains(&version),
                _ => false,
            }
        }
    }
}

/// `conda create` match spec for a requirement.
pub fn conda_python_spec(requirement: &str) -> String {
    if requirement.starts_with(['<', '>', '=', '!', '~']) {
        format!("python{requirement}")
    } else {
        format!("python={requirement}")
    }
}

/// Locates the host interpreter: an explicit path, else `python3`/`python` on `PATH`.
pub fn detect_host_python(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    for candidate in ["python3", "python"] {
        if let Ok(path) = which(candidate) {
            return Ok(path);
        }
    }
    bail!("no python interpreter found; set PVR_PYTHON")
}

pub fn detect_conda(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| which("conda").ok())
}

pub fn probe_version(runner: &dyn CommandRunner, python: &Path, cwd: &Path) -> Result<String> {
    let output = runner
        .run(
            python,
            &["-c".to_string(), VERSION_SCRIPT.to_string()],
            cwd,
        )
        .with_context(|| format!("failed to probe {}", python.display()))?;
    if !output.success() {
        return Err(anyhow!(
            "{} exited with {} while reporting its version: {}",
            python.display(),
            output.code,
            output.tail(5)
        ));
    }
    let version = output.stdout.trim().to_string();
    parse_channel(&version)
        .with_context(|| format!("unexpected version output `{version}`"))?;
    Ok(version)
}
