use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use tracing::trace;

/// Exclusive advisory lock held for as long as the guard lives.
#[derive(Debug)]
pub(crate) struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        trace!(lock = %self.path.display(), "released");
    }
}

/// Blocks until the lock file at `path` is held exclusively.
pub(crate) fn acquire(path: &Path) -> Result<StoreLock> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to open lock {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("failed to lock {}", path.display()))?;
    trace!(lock = %path.display(), "acquired");
    Ok(StoreLock {
        _file: file,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn second_holder_waits_for_release() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("locks").join("demo-1.0.0.lock");
        let first = acquire(&path).unwrap();
        assert!(path.exists());

        let (tx, rx) = mpsc::channel();
        let contender = path.clone();
        let handle = thread::spawn(move || {
            let _guard = acquire(&contender).unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(first);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }
}
