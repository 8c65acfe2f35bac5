//! Advisory file locks for the shelf files.
//!
//! The lock is a zero-byte file next to the data file. Acquisition spins
//! until the file is absent, then creates it while holding a process-local
//! mutex; the mutex serializes threads of this process, the file mediates
//! across processes. Release is deletion, on drop.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::store::StoreError;

/// How often the waiter re-checks for a released lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline before giving up on a held lock.
pub const DEFAULT_LOCK_DEADLINE: Duration = Duration::from_secs(600);

static LOCK_CREATE: Mutex<()> = Mutex::new(());

/// A held advisory lock; deleted when dropped.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock at `path`, waiting up to `deadline` for a holder to
    /// release it.
    pub fn acquire(path: &Path, deadline: Duration) -> Result<LockFile, StoreError> {
        let started = Instant::now();
        loop {
            if !path.exists() {
                let _guard = LOCK_CREATE.lock().unwrap_or_else(|e| e.into_inner());
                match OpenOptions::new().create_new(true).write(true).open(path) {
                    Ok(_) => {
                        return Ok(LockFile {
                            path: path.to_path_buf(),
                        });
                    }
                    // Another process won the race; keep waiting.
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                    Err(err) => {
                        return Err(StoreError::Io {
                            path: path.to_path_buf(),
                            source: err,
                        });
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(StoreError::LockTimeout {
                    path: path.to_path_buf(),
                    deadline_secs: deadline.as_secs(),
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(deadline - elapsed));
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
