// Single-instance guard: an exclusive advisory lock on a file under the
// data directory.
//
// The OS releases the lock when the holding process exits, so a crash never
// leaves a stale lock behind. The PID written into the file is only there
// for the "already running" message.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use wingman_types::{sys_info, sys_warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another {name} instance is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: String },
    #[error("cannot use lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

fn holder_pid(file: &mut File) -> String {
    let mut contents = String::new();
    match file.read_to_string(&mut contents) {
        Ok(_) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => "unknown".to_string(),
    }
}

impl InstanceLock {
    /// Take `{data_dir}/{name}.lock` for this process.
    pub fn acquire(data_dir: &Path, name: &str) -> Result<Self, LockError> {
        let path = data_dir.join(format!("{name}.lock"));
        let io_error = |source| LockError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(data_dir).map_err(io_error)?;
        // Not truncated on open: the current holder's PID must survive a
        // failed attempt.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(io_error(e));
            }
            return Err(LockError::AlreadyRunning {
                name: name.to_string(),
                pid: holder_pid(&mut file),
            });
        }

        let recorded = file
            .set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| write!(file, "{}", std::process::id()))
            .and_then(|_| file.flush());
        if let Err(e) = recorded {
            sys_warn!("[LOCK] Could not record pid in {}: {}", path.display(), e);
        }

        sys_info!("[LOCK] Acquired {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            sys_warn!("[LOCK] Failed to release {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::acquire(dir.path(), "wingman_server").unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );

        match InstanceLock::acquire(dir.path(), "wingman_server") {
            Err(LockError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, std::process::id().to_string())
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        drop(lock);
        assert!(InstanceLock::acquire(dir.path(), "wingman_server").is_ok());
    }

    #[test]
    fn test_leftover_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("wingman.lock"), "4000000000").unwrap();

        let lock = InstanceLock::acquire(dir.path(), "wingman").unwrap();
        let owner = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(owner, std::process::id().to_string());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        for _ in 0..50 {
            let dir = Arc::new(tempfile::tempdir().unwrap());
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let dir = dir.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        InstanceLock::acquire(dir.path(), "wingman").ok()
                    })
                })
                .collect();
            let held: Vec<_> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();
            assert_eq!(held.len(), 1);
        }
    }
}
