//! Single-instance guard
//!
//! An advisory `flock` on a per-user lock file. Only the holder may register
//! as the session service; the lock is released when the guard is dropped or
//! the process exits.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct InstanceGuard {
    lock: Flock<File>,
    path: PathBuf,
}

impl InstanceGuard {
    /// Try to become the single instance.
    ///
    /// Returns `Ok(None)` when another process already holds the lock.
    pub fn acquire(path: &Path) -> Result<Option<Self>, GuardError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GuardError::Open(path.to_path_buf(), e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| GuardError::Open(path.to_path_buf(), e))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                log::debug!("{} is held by another instance", path.display());
                return Ok(None);
            }
            Err((_, errno)) => return Err(GuardError::Lock(path.to_path_buf(), errno)),
        };

        write_pid(&mut lock).map_err(|e| GuardError::Open(path.to_path_buf(), e))?;

        log::debug!("acquired instance lock {}", path.display());
        Ok(Some(Self {
            lock,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded by the current holder of the lock file, if any
    pub fn holder(path: &Path) -> Option<u32> {
        let mut content = String::new();
        File::open(path).ok()?.read_to_string(&mut content).ok()?;
        content.trim().parse().ok()
    }
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // Unlocking happens when `lock` drops; the stale pid goes first
        let _ = self.lock.set_len(0);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Cannot open lock file {0}: {1}")]
    Open(PathBuf, #[source] std::io::Error),

    #[error("Cannot lock {0}: {1}")]
    Lock(PathBuf, Errno),
}
