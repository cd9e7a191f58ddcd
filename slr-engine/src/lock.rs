//! Run lock: one controller per state directory.
//!
//! A PID-based lock file prevents two pipeline controllers from
//! operating on the same version store concurrently. A lock whose
//! process is no longer alive is reclaimed after a diagnostic warning.
//! The lock is removed on clean exit via `Drop`.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run (pid {pid}) holds the lock at {path}")]
    Held { pid: u32, path: String },

    #[error("failed to create lock at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive run lock over a state directory.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock, reclaiming stale locks from dead processes.
    pub fn acquire(path: PathBuf) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.display().to_string(),
                source,
            })?;
        }

        if path.exists() {
            let holder = read_lock_pid(&path);
            match holder {
                Some(pid) if is_process_running(pid) => {
                    return Err(LockError::Held {
                        pid,
                        path: path.display().to_string(),
                    });
                }
                Some(pid) => {
                    warn!(
                        pid,
                        path = %path.display(),
                        "stale run lock from dead process; reclaiming"
                    );
                    let _ = fs::remove_file(&path);
                }
                None => {
                    warn!(path = %path.display(), "unreadable run lock; reclaiming");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        let mut file = File::create(&path).map_err(|source| LockError::Io {
            path: path.display().to_string(),
            source,
        })?;
        write!(file, "{}", std::process::id()).map_err(|source| LockError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_lock_pid(path: &std::path::Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Liveness probe for the lock-holder pid.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        // Conservative: treat unknown platforms' locks as stale so they
        // can always be reclaimed.
        let _ = pid;
        false
    }
}
