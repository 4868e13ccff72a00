//! Single-mutator guard for the update directory.
//!
//! Check, download, apply and rollback all touch the live binary, the backup
//! and `state.json`; only one agent instance may run them at a time.

use chrono::{SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{Result, UpdateError};
use crate::logging::log_warning;

pub const LOCK_FILE_NAME: &str = "update.lock";

/// Held for the duration of one update flow; the lock file is removed on drop
/// unless another holder has taken it over since.
#[derive(Debug)]
pub struct UpdateLock {
    path: PathBuf,
    token: String,
}

impl UpdateLock {
    /// Take the lock in `dir`, evicting a lock older than `stale_after` once.
    pub fn acquire(dir: &Path, stale_after: Duration) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| UpdateError::io(format!("failed to create {}", dir.display()), e))?;
        let path = dir.join(LOCK_FILE_NAME);

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let token = format!(
                        "pid={} started_at={}",
                        std::process::id(),
                        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
                    );
                    let written = file
                        .write_all(token.as_bytes())
                        .and_then(|()| file.sync_all());
                    if let Err(e) = written {
                        drop(file);
                        let _ = fs::remove_file(&path);
                        return Err(UpdateError::io(
                            format!("failed to write update lock {}", path.display()),
                            e,
                        ));
                    }
                    return Ok(Self { path, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_stale(&path, stale_after) {
                        log_warning(&format!("Removing stale update lock {}", path.display()));
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    let holder = fs::read_to_string(&path).unwrap_or_default();
                    return Err(UpdateError::Locked {
                        path,
                        holder: holder.trim().to_string(),
                    });
                }
                Err(e) => {
                    return Err(UpdateError::io(
                        format!("failed to create update lock {}", path.display()),
                        e,
                    ));
                }
            }
        }

        let holder = fs::read_to_string(&path).unwrap_or_default();
        Err(UpdateError::Locked {
            path,
            holder: holder.trim().to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.token => {
                let _ = fs::remove_file(&self.path);
            }
            Ok(_) => log_warning(&format!(
                "Update lock {} was taken over; leaving it in place",
                self.path.display()
            )),
            Err(_) => {}
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };

    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > stale_after,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let lock = UpdateLock::acquire(dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(lock.path().exists());

        let err = UpdateLock::acquire(dir.path(), Duration::from_secs(3600)).unwrap_err();
        match err {
            UpdateError::Locked { holder, .. } => {
                assert!(holder.contains(&format!("pid={}", std::process::id())));
            }
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let lock = UpdateLock::acquire(dir.path(), Duration::from_secs(3600)).unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
        UpdateLock::acquire(dir.path(), Duration::from_secs(3600)).unwrap();
    }

    #[test]
    fn test_drop_leaves_lock_taken_over_by_another_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = UpdateLock::acquire(dir.path(), Duration::from_secs(3600)).unwrap();
        let path = lock.path().to_path_buf();

        // another process evicted us as stale and holds the lock now
        fs::write(&path, "pid=4242 started_at=2026-10-15T08:00:00.000000000Z").unwrap();
        drop(lock);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "pid=4242 started_at=2026-10-15T08:00:00.000000000Z"
        );
        assert!(matches!(
            UpdateLock::acquire(dir.path(), Duration::from_secs(3600)),
            Err(UpdateError::Locked { .. })
        ));
    }

    #[test]
    fn test_stale_lock_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), "pid=1 started_at=long ago").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let lock = UpdateLock::acquire(dir.path(), Duration::from_millis(1)).unwrap();
        let content = fs::read_to_string(lock.path()).unwrap();
        assert!(content.starts_with(&format!("pid={}", std::process::id())));
    }
}
