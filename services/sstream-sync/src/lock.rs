//! Run Lock
//!
//! Cron fires the sync every few minutes while an image download can take
//! much longer. An advisory exclusive lock on a pid file keeps runs from
//! overlapping; the loser exits straight away.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_FILE: &str = "/var/run/glance-simplestreams-sync.pid";

/// Result of trying to take the lock
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(RunLock),
    /// Another process holds the lock
    AlreadyRunning,
}

/// Held run lock.
///
/// Released and the pid file removed on drop, so every exit path of a run
/// gives the lock back.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Try to lock `path` without blocking and record our pid in it
    pub fn acquire(path: &Path) -> io::Result<LockAttempt> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() || e.kind() == io::ErrorKind::WouldBlock {
                info!(path = %path.display(), "Lock file is held, exiting");
                return Ok(LockAttempt::AlreadyRunning);
            }
            return Err(e);
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!(path = %path.display(), pid = std::process::id(), "Acquired run lock");

        Ok(LockAttempt::Acquired(RunLock {
            path: path.to_path_buf(),
            file,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Remove before unlocking; a waiting run then creates a fresh file.
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        }
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}
