//! `requirements.txt` parsing and offline wheel coverage.

use std::str::FromStr;

use anyhow::{bail, Result};
use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::{Requirement as PepRequirement, VersionOrUrl};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequirementLine {
    pub line: usize,
    pub raw: String,
    pub name: String,
    /// Rendered PEP 440 specifiers; empty when unconstrained.
    pub specifiers: String,
    /// Requirements with markers or URLs are left to pip.
    pub checkable: bool,
}

pub(crate) fn parse_requirements(contents: &str) -> Result<Vec<RequirementLine>> {
    let mut parsed = Vec::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() || line.starts_with('-') {
            continue;
        }
        let Ok(req) = PepRequirement::from_str(line) else {
            bail!("requirements.txt line {}: `{line}` is not a valid requirement", idx + 1);
        };
        let (specifiers, is_url) = match req.version_or_url.as_ref() {
            Some(VersionOrUrl::VersionSpecifier(specs)) => (specs.to_string(), false),
            Some(VersionOrUrl::Url(_)) => (String::new(), true),
            None => (String::new(), false),
        };
        parsed.push(RequirementLine {
            line: idx + 1,
            raw: line.to_string(),
            name: normalize_name(req.name.as_ref()),
            specifiers,
            checkable: !is_url && req.marker.is_none(),
        });
    }
    Ok(parsed)
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// PEP 503 normalization: lowercase, runs of `-_.` become `-`.
pub(crate) fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            pending_dash = true;
            continue;
        }
        if pending_dash && !normalized.is_empty() {
            normalized.push('-');
        }
        pending_dash = false;
        normalized.push(ch.to_ascii_lowercase());
    }
    normalized
}

/// Splits a distribution file name into normalized name and version.
pub(crate) fn artifact_name_version(file_name: &str) -> Option<(String, String)> {
    if let Some(stem) = file_name.strip_suffix(".whl") {
        let mut parts = stem.split('-');
        let name = parts.next()?;
        let version = parts.next()?;
        return Some((normalize_name(name), version.to_string()));
    }
    let stem = [".tar.gz", ".tar.bz2", ".zip"]
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))?;
    let (name, version) = stem.rsplit_once('-')?;
    Some((normalize_name(name), version.to_string()))
}

/// Returns the requirements no bundled artifact satisfies.
pub(crate) fn missing_artifacts<'a>(
    requirements: &'a [RequirementLine],
    artifacts: &[String],
) -> Vec<&'a RequirementLine> {
    let available: Vec<(String, String)> = artifacts
        .iter()
        .filter_map(|file| artifact_name_version(file))
        .collect();
    requirements
        .iter()
        .filter(|req| {
            if !req.checkable {
                debug!(requirement = %req.raw, "leaving marker/url requirement to pip");
                return false;
            }
            !available
                .iter()
                .any(|(name, version)| name == &req.name && satisfies(&req.specifiers, version))
        })
        .collect()
}

fn satisfies(specifiers: &str, version: &str) -> bool {
    if specifiers.is_empty() {
        return true;
    }
    match (
        VersionSpecifiers::from_str(specifiers),
        Version::from_str(version),
    ) {
        (Ok(specs), Ok(version)) => specs.contains(&version),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pins_and_skips_noise() {
        let reqs = parse_requirements(
            "# comment\n\nnumpy==2.2.6\n--find-links wheels\nOpenCV_Python>=4.8  # cv\npywin32==306; sys_platform == 'win32'\n",
        )
        .unwrap();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].name, "numpy");
        assert_eq!(reqs[0].specifiers, "==2.2.6");
        assert_eq!(reqs[1].name, "opencv-python");
        assert_eq!(reqs[1].line, 5);
        assert!(!reqs[2].checkable);
    }

    #[test]
    fn invalid_lines_are_reported() {
        let err = parse_requirements("six\n@@@\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn artifact_names_split() {
        assert_eq!(
            artifact_name_version("opencv_python-4.10.0.84-cp37-abi3-win_amd64.whl"),
            Some(("opencv-python".into(), "4.10.0.84".into()))
        );
        assert_eq!(
            artifact_name_version("my-lib-1.0.tar.gz"),
            Some(("my-lib".into(), "1.0".into()))
        );
        assert_eq!(artifact_name_version("README.md"), None);
    }

    #[test]
    fn coverage_respects_specifiers() {
        let reqs = parse_requirements("numpy==2.2.6\nsix\nscipy>=1.10\n").unwrap();
        let artifacts = vec![
            "numpy-2.2.6-cp312-cp312-win_amd64.whl".to_string(),
            "six-1.16.0-py2.py3-none-any.whl".to_string(),
            "scipy-1.9.0-cp312-cp312-win_amd64.whl".to_string(),
        ];
        let missing = missing_artifacts(&reqs, &artifacts);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "scipy");
    }
}
