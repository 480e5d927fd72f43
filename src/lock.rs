// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Advisory run lock.
//!
//! Two runs on behalf of the same user would race on the same shell
//! startup files, nix.conf, and checkout. An exclusive advisory lock on a
//! per-user lock file keeps a second run from starting at all. The lock is
//! released when the guard drops, so every exit path releases it.
//!
//! The lock file lives in the target user's home, and belongs to that user
//! even when root took the lock, so later runs by the user can reopen it.

use crate::context::Account;

use fs4::fs_std::FileExt;
use std::{
    fs::{create_dir_all, File, OpenOptions},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Guard holding exclusive run lock.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire exclusive lock on file without waiting.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Held`] if another process holds the lock.
    /// - Return [`LockError::Io`] if lock file cannot be opened or locked.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        Self::acquire_as(path, None)
    }

    /// Acquire exclusive lock on file on behalf of an account.
    ///
    /// Missing parent directories are created. If an owner is given, the
    /// directories created and the lock file itself are handed over to it.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Held`] if another process holds the lock.
    /// - Return [`LockError::Io`] if lock file cannot be created, handed
    ///   over, opened, or locked.
    #[instrument(skip(path, owner), level = "debug")]
    pub fn acquire_as(path: impl AsRef<Path>, owner: Option<&Account>) -> Result<Self> {
        let path = path.as_ref();
        let io_error = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut created = Vec::new();
        if let Some(parent) = path.parent() {
            created = parent
                .ancestors()
                .take_while(|dir| !dir.as_os_str().is_empty() && !dir.exists())
                .map(Path::to_path_buf)
                .collect();
            create_dir_all(parent).map_err(io_error)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_error)?;
        if let Some(account) = owner {
            for entry in created.iter().map(PathBuf::as_path).chain([path]) {
                account.take_ownership(entry).map_err(|source| LockError::Io {
                    path: entry.to_path_buf(),
                    source,
                })?;
            }
        }
        if !file.try_lock_exclusive().map_err(io_error)? {
            return Err(LockError::Held {
                path: path.to_path_buf(),
            });
        }
        debug!("acquired run lock {:?}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("failed to release run lock {:?}: {err}", self.path.display());
        }
    }
}

/// Run lock error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another run holds the lock.
    #[error("another nixboot run holds {:?}, wait for it to finish", path.display())]
    Held { path: PathBuf },

    /// Lock file cannot be used.
    #[error("failed to lock {:?}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LockError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_is_refused_until_first_drops() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nixboot-alice.lock");

        let first = RunLock::acquire(&path)?;
        assert!(matches!(RunLock::acquire(&path), Err(LockError::Held { .. })));

        drop(first);
        let again = RunLock::acquire(&path)?;
        assert_eq!(again.path(), path.as_path());

        Ok(())
    }

    #[test]
    fn missing_cache_directories_are_created() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = crate::path::lock_file(dir.path().join("alice"));

        let lock = RunLock::acquire(&path)?;
        assert!(lock.path().is_file());
        assert!(path.ends_with(".cache/nixboot/run.lock"));

        Ok(())
    }

    #[test]
    fn lock_file_is_handed_to_owner() -> anyhow::Result<()> {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir()?;
        let home = dir.path().join("alice");
        let account = Account {
            name: "alice".into(),
            uid: uzers::get_current_uid(),
            gid: uzers::get_current_gid(),
            home: home.clone(),
            shell: PathBuf::from("/bin/sh"),
        };
        let path = crate::path::lock_file(&home);

        let _lock = RunLock::acquire_as(&path, Some(&account))?;
        let cache = home.join(".cache");
        for entry in [path.as_path(), cache.as_path()] {
            let metadata = std::fs::metadata(entry)?;
            assert_eq!(metadata.uid(), account.uid);
            assert_eq!(metadata.gid(), account.gid);
        }

        Ok(())
    }

    #[test]
    fn locks_of_different_users_are_independent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let _alice = RunLock::acquire(dir.path().join("nixboot-alice.lock"))?;
        let _bob = RunLock::acquire(dir.path().join("nixboot-bob.lock"))?;

        Ok(())
    }
}
