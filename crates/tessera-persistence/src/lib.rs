//! tessera-persistence: durability layer.
//!
//! Stores the single cluster metadata record with checksums, atomic
//! replacement and a lock shared across processes.

pub mod format;
pub mod lock;
pub mod record;

pub use format::FormatError;
pub use lock::{lock_path, RecordLock};
pub use record::{read_record, record_path, write_record, MetadataRecord, RECORD_FILE_NAME};
