use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::StateError;

/// Exclusive advisory lock on one build id, released on drop.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(super) fn acquire(build_id: &str, lock_path: PathBuf) -> Result<BuildLock, StateError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(|source| StateError::Io {
            context: format!("creating lock directory '{}'", parent.display()),
            source,
        })?;
    }

    // Lock files are never unlinked: removing a file another process still
    // holds a lock on would let a third process lock a fresh inode at the
    // same path.
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| StateError::Io {
            context: format!("opening lock file '{}'", lock_path.display()),
            source,
        })?;

    if file.try_lock_exclusive().is_err() {
        return Err(StateError::Locked(build_id.to_string()));
    }

    Ok(BuildLock {
        _file: file,
        path: lock_path,
    })
}
