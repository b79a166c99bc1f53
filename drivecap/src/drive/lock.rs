//! Exclusive ownership of a drive home directory.
//!
//! A file-backed drive keeps its chunk map and non-paged state under one
//! directory. Two processes driving the same files would interleave
//! checkpoint writes, so opening a drive home takes an flock on
//! `<home>/.lock` first.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use drivecap_shared::{DrivecapError, DrivecapResult};

/// Exclusive lock on a drive home directory.
///
/// Released when dropped, or when the process exits.
#[derive(Debug)]
pub struct HomeLock {
    #[allow(dead_code)] // Held for lifetime, not directly accessed
    file: File,
    path: PathBuf,
}

impl HomeLock {
    /// Take the lock, creating `home_dir` if needed. Fails immediately if
    /// another process (or another open in this one) holds it.
    pub fn acquire(home_dir: &Path) -> DrivecapResult<Self> {
        std::fs::create_dir_all(home_dir)
            .map_err(|e| DrivecapError::Storage(format!("failed to create home dir: {}", e)))?;

        let lock_path = home_dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| DrivecapError::Storage(format!("failed to open lock file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(DrivecapError::InvalidState(format!(
                        "drive home {} is in use by another process",
                        home_dir.display()
                    )));
                }
                return Err(DrivecapError::Storage(format!(
                    "failed to acquire lock: {}",
                    err
                )));
            }
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired drive home lock");

        Ok(HomeLock {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HomeLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }

        tracing::debug!(lock_path = %self.path.display(), "Released drive home lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_prevents_second_owner() {
        let temp_dir = TempDir::new().unwrap();
        let _lock = HomeLock::acquire(temp_dir.path()).unwrap();

        let err = HomeLock::acquire(temp_dir.path()).unwrap_err();
        assert!(matches!(err, DrivecapError::InvalidState(_)));
        assert!(err.to_string().contains("in use"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        {
            let _lock = HomeLock::acquire(temp_dir.path()).unwrap();
        }
        let lock = HomeLock::acquire(temp_dir.path()).unwrap();
        assert_eq!(lock.path(), temp_dir.path().join(".lock"));
    }

    #[test]
    fn test_creates_missing_home() {
        let temp_dir = TempDir::new().unwrap();
        let home = temp_dir.path().join("nested").join("drive0");
        let _lock = HomeLock::acquire(&home).unwrap();
        assert!(home.join(".lock").exists());
    }
}
