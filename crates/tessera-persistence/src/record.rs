//! The durable cluster metadata record.
//!
//! A cluster keeps exactly one logical record: the identity of the last
//! metadata writer, the metadata version, and the serialized metadata
//! payload. Writes go to a `.tmp` file private to the writer that is
//! fsynced and atomically renamed over the previous record, so a crash
//! mid-write leaves the old record intact.
//!
//! File layout:
//! ```text
//! [TMDR magic: 4B][format version: 1B]
//! [writer uuid: 16B][metadata version: 8B][payload_len: 4B][payload]
//! [crc32: 4B]
//! ```
//! The CRC covers everything between the header and the footer.

use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::debug;

use crate::format::{self, FormatError};

/// File name used for the record inside a data directory.
pub const RECORD_FILE_NAME: &str = "metadata.tmdr";

/// One persisted metadata version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Raw bytes of the uuid identifying the node that wrote this version.
    pub writer: [u8; 16],
    /// Metadata version number.
    pub version: u64,
    /// Serialized metadata.
    pub payload: Bytes,
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns the record path inside `data_dir`.
pub fn record_path(data_dir: &Path) -> PathBuf {
    data_dir.join(RECORD_FILE_NAME)
}

/// Atomically replaces the record at `path`.
pub fn write_record(path: &Path, record: &MetadataRecord) -> Result<(), FormatError> {
    let mut body = Vec::with_capacity(28 + record.payload.len());
    body.extend_from_slice(&record.writer);
    format::write_u64(&mut body, record.version)?;
    format::write_bytes(&mut body, &record.payload)?;

    let tmp_path = path.with_extension(format!(
        "tmdr.{}-{}.tmp",
        process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let result = write_tmp(&tmp_path, &body).and_then(|()| {
        fs::rename(&tmp_path, path)?;
        Ok(())
    });
    if result.is_err() {
        // best-effort cleanup of the incomplete temp file
        let _ = fs::remove_file(&tmp_path);
    }
    result?;

    debug!(
        path = %path.display(),
        version = record.version,
        bytes = record.payload.len(),
        "metadata record written"
    );
    Ok(())
}

fn write_tmp(tmp_path: &Path, body: &[u8]) -> Result<(), FormatError> {
    let file = File::create(tmp_path)?;
    let mut writer = BufWriter::new(file);
    format::write_header(&mut writer, format::RECORD_MAGIC)?;
    writer.write_all(body)?;
    format::write_u32(&mut writer, format::crc32(body))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Reads the record at `path`. A missing file is not an error: the
/// cluster simply has no persisted metadata yet.
pub fn read_record(path: &Path) -> Result<Option<MetadataRecord>, FormatError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut cursor = Cursor::new(data.as_slice());
    format::read_header(&mut cursor, format::RECORD_MAGIC)?;
    let body_start = cursor.position() as usize;

    let writer: [u8; 16] = format::read_array(&mut cursor)?;
    let version = format::read_u64(&mut cursor)?;
    let payload = format::read_bytes(&mut cursor)?;
    let body_end = cursor.position() as usize;

    let expected = format::read_u32(&mut cursor)?;
    format::verify_crc32(&data[body_start..body_end], expected)?;

    let mut trailing = [0u8; 1];
    if cursor.read(&mut trailing)? != 0 {
        return Err(FormatError::InvalidData(
            "trailing bytes after record footer".into(),
        ));
    }

    Ok(Some(MetadataRecord {
        writer,
        version,
        payload: Bytes::from(payload),
    }))
}
