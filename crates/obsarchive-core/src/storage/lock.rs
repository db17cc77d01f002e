//! Advisory locking on the `<container>.lock` sidecar.
//!
//! Writers take an exclusive `flock` for the whole lifetime of their handle;
//! readers take a shared one. Acquisition polls with `LOCK_NB` until the
//! configured timeout elapses and then fails with `LockTimeout`, so a crashed
//! or stuck peer can never wedge a caller indefinitely.
//!
//! The sidecar is created on first use and never deleted: removing it would
//! let a waiter lock an unlinked inode while a newcomer locks a fresh file.
//!
//! Degraded mode: on platforms without `flock`, or when a reader cannot
//! create the sidecar (read-only medium), the guard holds no lock and a
//! warning is logged. Writers never degrade.

use std::{
    ffi::OsString,
    fmt,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use snafu::prelude::*;

use crate::error::{ArchiveResult, IoSnafu, LockTimeoutSnafu};

/// Kind of advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many holders, excludes exclusive holders.
    Shared,
    /// Single holder.
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Path of the lock sidecar for `container`.
pub fn lock_path(container: &Path) -> PathBuf {
    let mut name = OsString::from(container.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Held advisory lock, released on [`LockGuard::release`] or drop.
#[derive(Debug)]
pub(crate) struct LockGuard {
    file: Option<File>,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    /// Acquire `mode` on the sidecar of `container`, waiting at most
    /// `timeout` and polling every `poll`.
    pub(crate) fn acquire(
        container: &Path,
        mode: LockMode,
        timeout: Duration,
        poll: Duration,
    ) -> ArchiveResult<Self> {
        let path = lock_path(container);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if mode == LockMode::Shared && is_read_only_medium(&e) => {
                warn!(
                    "cannot create lock file {} ({e}); reading without a shared lock",
                    path.display()
                );
                return Ok(Self::unlocked(container, mode));
            }
            Err(e) => {
                return Err(e).context(IoSnafu {
                    path: path.display().to_string(),
                });
            }
        };

        let start = Instant::now();
        let poll = poll.max(Duration::from_millis(1));
        loop {
            let acquired = try_lock(&file, mode).context(IoSnafu {
                path: path.display().to_string(),
            })?;
            if acquired {
                debug!(
                    "acquired {mode} lock on {} after {:?}",
                    path.display(),
                    start.elapsed()
                );
                return Ok(Self {
                    file: Some(file),
                    path,
                    mode,
                });
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return LockTimeoutSnafu {
                    path: container.display().to_string(),
                    mode,
                    waited_ms: waited.as_millis(),
                }
                .fail();
            }
            thread::sleep(poll.min(timeout - waited));
        }
    }

    /// A guard that holds nothing; used where shared locks are unavailable.
    pub(crate) fn unlocked(container: &Path, mode: LockMode) -> Self {
        Self {
            file: None,
            path: lock_path(container),
            mode,
        }
    }

    /// Whether an OS lock is actually held.
    pub(crate) fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the lock. Safe to call more than once.
    pub(crate) fn release(&mut self) {
        if let Some(file) = self.file.take() {
            unlock(&file);
            debug!("released {} lock on {}", self.mode, self.path.display());
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_read_only_medium(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
    )
}

/// `Ok(false)` means the lock is held elsewhere.
#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
        _ => Err(err),
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File, mode: LockMode) -> io::Result<bool> {
    warn!("advisory {mode} locks are not supported on this platform; proceeding unlocked");
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
