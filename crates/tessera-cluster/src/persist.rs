//! Durable metadata with optimistic concurrency.
//!
//! The cluster keeps one persisted metadata record. Every writer reads the
//! record's `(uuid, version)`, derives a new revision, and writes it back
//! only if the record still carries the revision it started from. A
//! mismatch means another writer got there first and is reported as
//! [`ClusterError::Conflict`]; the caller retries against fresh state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tessera_persistence::{read_record, record_path, write_record, MetadataRecord, RecordLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::state::MetaData;
use crate::ClusterError;

/// The `(uuid, version)` revision a writer expects to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    pub uuid: Uuid,
    pub version: u64,
}

impl Revision {
    pub fn of(metadata: &MetaData) -> Self {
        Self {
            uuid: metadata.uuid,
            version: metadata.version,
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.uuid, self.version)
    }
}

/// Storage for the single metadata record.
pub trait MetadataStore: Send + Sync + 'static {
    /// Reads the current record, if any.
    fn load(&self) -> Result<Option<MetaData>, ClusterError>;

    /// Writes `new` only if the stored record is at `expected`. An empty
    /// store matches the default (nil uuid, version 0) revision.
    fn compare_and_swap(&self, expected: Revision, new: &MetaData) -> Result<(), ClusterError>;
}

fn conflict(expected: Revision, found: Revision) -> ClusterError {
    ClusterError::Conflict {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Revision of a possibly-empty store.
fn current_revision(current: Option<&MetaData>) -> Revision {
    current.map(Revision::of).unwrap_or(Revision {
        uuid: Uuid::nil(),
        version: 0,
    })
}

/// Metadata store kept in memory. Shared between handles with `Arc`.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    record: Mutex<Option<MetaData>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the record without any check, as another writer would.
    pub fn force(&self, metadata: MetaData) {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(metadata);
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self) -> Result<Option<MetaData>, ClusterError> {
        Ok(self.record.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn compare_and_swap(&self, expected: Revision, new: &MetaData) -> Result<(), ClusterError> {
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        let found = current_revision(record.as_ref());
        if found != expected {
            return Err(conflict(expected, found));
        }
        *record = Some(new.clone());
        Ok(())
    }
}

/// How long a writer waits for another writer's record lock.
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Metadata store backed by a record file in a data directory.
///
/// Any number of stores, in any number of processes, may share a
/// directory: compare-and-swap holds the directory's [`RecordLock`] from
/// the read to the rename.
#[derive(Debug)]
pub struct FileMetadataStore {
    path: PathBuf,
    // keeps writers of this instance off the lock file
    lock: Mutex<()>,
}

impl FileMetadataStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: record_path(data_dir),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<MetaData>, ClusterError> {
        let Some(record) = read_record(&self.path)? else {
            return Ok(None);
        };
        let metadata: MetaData = serde_json::from_slice(&record.payload)
            .map_err(|e| ClusterError::persistence(format!("corrupt metadata payload: {e}")))?;
        if metadata.version != record.version || metadata.uuid.as_bytes() != &record.writer {
            return Err(ClusterError::persistence(format!(
                "record header {}/{} disagrees with payload {}",
                Uuid::from_bytes(record.writer),
                record.version,
                metadata.revision()
            )));
        }
        Ok(Some(metadata))
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&self) -> Result<Option<MetaData>, ClusterError> {
        // records are replaced by rename, so a read never sees a partial one
        self.read()
    }

    fn compare_and_swap(&self, expected: Revision, new: &MetaData) -> Result<(), ClusterError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _record_lock = RecordLock::acquire(&self.path, LOCK_WAIT)?;
        let current = self.read()?;
        let found = current_revision(current.as_ref());
        if found != expected {
            return Err(conflict(expected, found));
        }

        let payload = serde_json::to_vec(new)
            .map_err(|e| ClusterError::persistence(format!("failed to encode metadata: {e}")))?;
        write_record(
            &self.path,
            &MetadataRecord {
                writer: *new.uuid.as_bytes(),
                version: new.version,
                payload: Bytes::from(payload),
            },
        )?;
        Ok(())
    }
}

/// Persists metadata revisions, surfacing write/write conflicts.
#[derive(Clone)]
pub struct ConflictAwarePersister {
    store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for ConflictAwarePersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictAwarePersister").finish_non_exhaustive()
    }
}

impl ConflictAwarePersister {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Reads the persisted metadata.
    pub fn read(&self) -> Result<Option<MetaData>, ClusterError> {
        self.store.load()
    }

    /// Durably records `new` as the successor of `previous`.
    ///
    /// Fails with [`ClusterError::Conflict`] if the stored record is no
    /// longer at `previous`'s revision.
    pub fn persist(&self, previous: &MetaData, new: &MetaData, source: &str) -> Result<(), ClusterError> {
        let expected = Revision::of(previous);
        match self.store.compare_and_swap(expected, new) {
            Ok(()) => {
                info!(
                    source,
                    from = %expected,
                    to = %Revision::of(new),
                    "metadata persisted"
                );
                Ok(())
            }
            Err(e) => {
                debug!(source, error = %e, "metadata persist rejected");
                Err(e)
            }
        }
    }
}
