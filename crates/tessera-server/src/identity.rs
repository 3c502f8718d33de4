//! Host id persistence.
//!
//! A node's host id is generated on first start and kept in the data dir,
//! so restarts announce the same identity in gossip.

use std::io;
use std::path::Path;

use tessera_cluster::NodeId;
use tracing::info;
use uuid::Uuid;

/// File in the data dir holding the host id.
pub const HOST_ID_FILE: &str = "host-id";

/// Reads the host id from `dir`, creating and storing a fresh one if none
/// exists yet.
pub fn load_or_create(dir: &Path) -> io::Result<NodeId> {
    let path = dir.join(HOST_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let uuid = Uuid::parse_str(text.trim()).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt host id in '{}': {e}", path.display()),
                )
            })?;
            Ok(NodeId(uuid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir)?;
            let id = NodeId::new();
            let tmp = dir.join(format!("{HOST_ID_FILE}.tmp"));
            std::fs::write(&tmp, format!("{}\n", id.to_full_string()))?;
            std::fs::rename(&tmp, &path)?;
            info!(host_id = %id, path = %path.display(), "generated new host id");
            Ok(id)
        }
        Err(e) => Err(e),
    }
}
