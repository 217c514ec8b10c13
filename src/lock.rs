use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{io_context, ForgeError};
use crate::logger::Logger;
use crate::shell::{check_flag, INTERRUPTED};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: String,
}

/// Exclusive advisory lock on a lock file. The file itself stays in place;
/// the OS drops the lock when the guard closes it or the process dies.
#[derive(Debug)]
pub(crate) struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquires `path`, waiting up to `timeout` for the current holder to finish.
/// Ctrl-C ends the wait.
pub(crate) fn acquire(
    path: &Path,
    label: &str,
    timeout: Duration,
    logger: &Logger,
) -> Result<LockGuard, ForgeError> {
    acquire_with(path, label, timeout, &INTERRUPTED, logger)
}

fn acquire_with(
    path: &Path,
    label: &str,
    timeout: Duration,
    interrupted: &AtomicBool,
    logger: &Logger,
) -> Result<LockGuard, ForgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(io_context(format!("Failed to create {}", parent.display())))?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(io_context(format!("Failed to open lock {}", path.display())))?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                record_owner(&mut file)
                    .map_err(io_context(format!("Failed to write lock {}", path.display())))?;
                logger.log(&format!("lock acquired label={} path={}", label, path.display()));
                return Ok(LockGuard { file });
            }
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {}
            Err(err) => {
                return Err(ForgeError::Io {
                    context: format!("Failed to lock {}", path.display()),
                    source: err,
                })
            }
        }

        if Instant::now() >= deadline {
            let holder = read_owner(&mut file)
                .map(|owner| format!("pid {} since {}", owner.pid, owner.acquired_at))
                .unwrap_or_else(|| "unknown holder".to_string());
            logger.log(&format!("lock contention label={} holder={}", label, holder));
            return Err(ForgeError::LockContention {
                id: label.to_string(),
                holder,
            });
        }
        thread::sleep(POLL_INTERVAL);
        check_flag(interrupted)?;
    }
}

fn record_owner(file: &mut File) -> io::Result<()> {
    let owner = LockOwner {
        pid: std::process::id(),
        acquired_at: Utc::now().to_rfc3339(),
    };
    let rendered = serde_json::to_string(&owner)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(rendered.as_bytes())?;
    file.flush()
}

/// Owner details are informational; a holder may not have written them yet.
fn read_owner(file: &mut File) -> Option<LockOwner> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
}
