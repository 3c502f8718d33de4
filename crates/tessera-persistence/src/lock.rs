//! Exclusive lock on the metadata record, shared by every process that
//! opens the same data directory.
//!
//! The lock is a file created with `create_new` next to the record and
//! removed when the [`RecordLock`] drops. A writer that dies while holding
//! it leaves the file behind; once the file is older than [`STALE_AFTER`]
//! the next writer breaks it.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::format::FormatError;

/// Age after which a leftover lock file is considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Returns the lock path for the record at `record`.
pub fn lock_path(record: &Path) -> PathBuf {
    record.with_extension("tmdr.lock")
}

/// Held while a writer reads, compares and replaces the record.
#[derive(Debug)]
pub struct RecordLock {
    path: PathBuf,
}

impl RecordLock {
    /// Takes the lock for the record at `record`, waiting up to `wait`
    /// for the current holder to let go.
    pub fn acquire(record: &Path, wait: Duration) -> Result<Self, FormatError> {
        let path = lock_path(record);
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            if is_stale(&path) {
                warn!(path = %path.display(), "breaking abandoned metadata record lock");
                let _ = fs::remove_file(&path);
                continue;
            }
            if Instant::now() >= deadline {
                return Err(FormatError::Locked(path.display().to_string()));
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_AFTER)
}
