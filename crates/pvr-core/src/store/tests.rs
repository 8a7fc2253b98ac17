use std::fs;
use std::sync::Arc;

use super::*;
use crate::test_support::{test_config, ArchiveBuilder, FakeRunner};

struct Fixture {
    temp: tempfile::TempDir,
    store: PackageStore,
    runner: Arc<FakeRunner>,
}

fn fixture_with(runner: FakeRunner) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let runner = Arc::new(runner);
    let store = PackageStore::new(test_config(&temp.path().join("root")), runner.clone());
    Fixture {
        temp,
        store,
        runner,
    }
}

fn fixture() -> Fixture {
    fixture_with(FakeRunner::default())
}

impl Fixture {
    fn demo_archive(&self) -> PathBuf {
        ArchiveBuilder::demo("demo.run", &["P1"]).write(&self.temp.path().join("demo-1.0.0.zip"))
    }

    fn install_dir(&self) -> PathBuf {
        self.store.config().deployed_dir().join("demo").join("1.0.0")
    }
}

#[test]
fn installs_minimal_archive() {
    let fx = fixture();
    let result = fx.store.install_package(&fx.demo_archive()).unwrap();
    assert_eq!(result.outcome, InstallOutcome::Installed);
    assert!(fx.store.is_installed("demo", "1.0.0"));
    assert_eq!(result.entry.install_path, fx.install_dir());
    assert_eq!(result.entry.environment_path, fx.install_dir().join("venv"));
    assert!(fx.install_dir().join(RECEIPT_FILE).is_file());
    assert!(fx.install_dir().join("manifest.json").is_file());
}

#[test]
fn second_install_is_a_no_op() {
    let fx = fixture();
    let archive = fx.demo_archive();
    let first = fx.store.install_package(&archive).unwrap();
    let venv_calls = fx.runner.calls().len();
    let second = fx.store.install_package(&archive).unwrap();
    assert_eq!(second.outcome, InstallOutcome::AlreadyInstalled);
    assert_eq!(second.entry, first.entry);
    assert_eq!(fx.runner.calls().len(), venv_calls);
    assert_eq!(fx.store.list_installed().len(), 1);
}

#[test]
fn uninstall_removes_and_reports() {
    let fx = fixture();
    fx.store.install_package(&fx.demo_archive()).unwrap();
    assert!(fx.store.uninstall_package("demo", "1.0.0").unwrap());
    assert!(!fx.install_dir().exists());
    assert!(!fx.store.config().deployed_dir().join("demo").exists());
    assert!(!fx.store.is_installed("demo", "1.0.0"));
    assert!(!fx.store.uninstall_package("demo", "1.0.0").unwrap());
}

#[test]
fn uninstall_keeps_entry_when_directory_cannot_be_removed() {
    let fx = fixture();
    fx.store.install_package(&fx.demo_archive()).unwrap();
    fs::remove_dir_all(fx.install_dir()).unwrap();
    fs::write(fx.install_dir(), b"not a directory").unwrap();

    let err = fx.store.uninstall_package("demo", "1.0.0").unwrap_err();
    assert_eq!(err.code(), "2005");
    assert!(fx.install_dir().exists());
    assert!(fx.store.is_installed("demo", "1.0.0"));
}

#[test]
fn uninstall_of_impossible_identity_is_false() {
    let fx = fixture();
    assert!(!fx.store.is_installed("../demo", "1.0.0"));
    assert!(!fx.store.uninstall_package("../demo", "1.0.0").unwrap());
    assert!(!fx.store.uninstall_package("demo", "").unwrap());
}

#[test]
fn failed_dependency_install_leaves_nothing_behind() {
    let fx = fixture_with(FakeRunner {
        fail_pip: true,
        ..FakeRunner::default()
    });
    let archive = ArchiveBuilder::manifest("demo.run", &["P1"])
        .file("requirements.txt", b"six==1.16.0\n")
        .file("wheels/six-1.16.0-py2.py3-none-any.whl", b"whl")
        .write(&fx.temp.path().join("demo-1.0.0.zip"));
    let err = fx.store.install_package(&archive).unwrap_err();
    assert_eq!(err.code(), "2009");
    assert!(!fx.install_dir().exists());
    assert!(!fx.store.is_installed("demo", "1.0.0"));
}

#[test]
fn missing_wheel_rolls_back() {
    let fx = fixture();
    let archive = ArchiveBuilder::manifest("demo.run", &["P1"])
        .file("requirements.txt", b"numpy==2.2.6\n")
        .dir("wheels/")
        .write(&fx.temp.path().join("demo-1.0.0.zip"));
    let err = fx.store.install_package(&archive).unwrap_err();
    assert!(err.to_string().contains("numpy==2.2.6"));
    assert!(!fx.install_dir().exists());
    assert!(fx.store.list_installed().is_empty());
}

#[test]
fn stale_directory_is_replaced() {
    let fx = fixture();
    fs::create_dir_all(fx.install_dir()).unwrap();
    fs::write(fx.install_dir().join("leftover"), b"x").unwrap();
    fx.store.install_package(&fx.demo_archive()).unwrap();
    assert!(!fx.install_dir().join("leftover").exists());
    assert!(fx.store.is_installed("demo", "1.0.0"));
}

#[test]
fn corrupt_registry_reads_as_nothing_installed() {
    let fx = fixture();
    fx.store.install_package(&fx.demo_archive()).unwrap();
    fs::write(fx.store.config().registry_path(), b"\x00garbage").unwrap();
    assert!(fx.store.list_installed().is_empty());

    let rebuilt = fx.store.rebuild_registry().unwrap();
    assert_eq!(rebuilt.len(), 1);
    assert!(fx.store.is_installed("demo", "1.0.0"));
}

#[test]
fn activation_rules() {
    let fx = fixture();
    let err = fx.store.activate("P1", "demo", "1.0.0").unwrap_err();
    assert_eq!(err.code(), "2008");

    fx.store.install_package(&fx.demo_archive()).unwrap();
    let err = fx.store.activate("P9", "demo", "1.0.0").unwrap_err();
    assert_eq!(err.code(), "2006");
    assert!(fx.store.activate("../P1", "demo", "1.0.0").is_err());

    fx.store.activate("P1", "demo", "1.0.0").unwrap();
    let active = fx.store.active_package("P1").unwrap();
    assert_eq!(active.entry_point, "demo.run");
    assert!(fx.store.active_package("P2").is_none());

    let key = PackageKey::new("demo", "1.0.0").unwrap();
    assert_eq!(fx.store.active_pids_for(&key), vec!["P1".to_string()]);
    let err = fx.store.uninstall_package("demo", "1.0.0").unwrap_err();
    assert!(matches!(err, RunnerError::UnsafeUninstall { .. }));
    assert!(fx.install_dir().exists());

    assert!(fx.store.deactivate("P1").unwrap());
    assert!(!fx.store.deactivate("P1").unwrap());
    assert!(fx.store.uninstall_package("demo", "1.0.0").unwrap());
}

#[test]
fn scan_lists_zip_drop_directory() {
    let fx = fixture();
    assert!(fx.store.scan_archives().unwrap().is_empty());
    let zips = fx.store.config().zips_dir();
    fs::create_dir_all(&zips).unwrap();
    fs::write(zips.join("b-1.0.zip"), b"").unwrap();
    fs::write(zips.join("a-1.0.ZIP"), b"").unwrap();
    fs::write(zips.join("notes.txt"), b"").unwrap();
    let found = fx.store.scan_archives().unwrap();
    assert_eq!(found, vec![zips.join("a-1.0.ZIP"), zips.join("b-1.0.zip")]);
}
