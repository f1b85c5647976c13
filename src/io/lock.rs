use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Advisory file lock serializing task-file access between processes.
///
/// Uses platform-native flock (Unix). The lock is cooperative: it only
/// coordinates processes that also take it, which is all this crate's
/// callers do around load/save/merge.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

/// Error type for lock operations.
///
/// `Timeout` and `Unsupported` demand different recovery from the
/// caller: retry or break the lock versus proceeding unlocked by
/// explicit choice (network and FUSE filesystems often can't flock).
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not create lock file at {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not acquire lock on {path}: another process may be writing")]
    Timeout { path: PathBuf },
    #[error("locking is not supported at {path}")]
    Unsupported { path: PathBuf },
    #[error("lock error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default acquisition timeout.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

enum TryLockFailure {
    Contended,
    Unsupported,
}

impl FileLock {
    /// Path of the lock file guarding `target`.
    pub fn lock_path(target: &Path) -> PathBuf {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        target.with_file_name(name)
    }

    /// Acquire an advisory lock for the given task file, blocking up to
    /// `timeout`.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self, LockError> {
        let lock_path = Self::lock_path(target);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| LockError::Create {
                path: lock_path.clone(),
                source: e,
            })?;

        let start = Instant::now();
        loop {
            match try_lock(&file) {
                Ok(()) => {
                    return Ok(FileLock {
                        _file: file,
                        path: lock_path,
                    });
                }
                Err(TryLockFailure::Unsupported) => {
                    return Err(LockError::Unsupported { path: lock_path });
                }
                Err(TryLockFailure::Contended) if start.elapsed() < timeout => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(TryLockFailure::Contended) => {
                    return Err(LockError::Timeout { path: lock_path });
                }
            }
        }
    }

    /// Acquire with the default timeout.
    pub fn acquire_default(target: &Path) -> Result<Self, LockError> {
        Self::acquire(target, LOCK_TIMEOUT)
    }

    /// Remove a (presumed stale) lock file left by a crashed process.
    /// The next `acquire` starts fresh.
    pub fn break_lock(target: &Path) -> Result<(), LockError> {
        let lock_path = Self::lock_path(target);
        match fs::remove_file(&lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io(e)),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // flock releases with the descriptor; clean up the marker file
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<(), TryLockFailure> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ENOTSUP) | Some(libc::EINVAL) | Some(libc::ENOLCK) => {
            Err(TryLockFailure::Unsupported)
        }
        _ => Err(TryLockFailure::Contended),
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<(), TryLockFailure> {
    // No flock; treat the lock as always available (advisory anyway)
    Ok(())
}
