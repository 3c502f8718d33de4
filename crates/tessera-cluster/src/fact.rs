//! Encoding of the values this crate publishes in gossip slots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gossip::FactSlot;
use crate::node::NodeId;
use crate::state::MetaData;
use crate::ClusterError;

/// Content of the `MetadataVersion` slot: `"<uuid>/<version>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataVersionFact {
    pub uuid: Uuid,
    pub version: u64,
}

impl MetadataVersionFact {
    pub fn of(metadata: &MetaData) -> Self {
        Self {
            uuid: metadata.uuid,
            version: metadata.version,
        }
    }
}

impl fmt::Display for MetadataVersionFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uuid, self.version)
    }
}

impl FromStr for MetadataVersionFact {
    type Err = ClusterError;

    /// Splits on the last `/`, so only the version is taken from the tail.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: String| ClusterError::MalformedFact {
            slot: FactSlot::MetadataVersion,
            reason,
        };
        let (uuid, version) = s
            .rsplit_once('/')
            .ok_or_else(|| malformed(format!("missing '/' in {s:?}")))?;
        let uuid = Uuid::parse_str(uuid).map_err(|e| malformed(format!("bad uuid {uuid:?}: {e}")))?;
        let version = version
            .parse::<u64>()
            .map_err(|e| malformed(format!("bad version {version:?}: {e}")))?;
        Ok(Self { uuid, version })
    }
}

/// Parses a host id fact.
pub fn parse_host_id(value: &str) -> Result<NodeId, ClusterError> {
    NodeId::parse(value).map_err(|e| ClusterError::MalformedFact {
        slot: FactSlot::HostId,
        reason: e.to_string(),
    })
}

/// Routing state of an index's shards on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

/// Content of the `ShardStates` slot: index name to shard state, as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardStates(pub BTreeMap<String, ShardState>);

impl ShardStates {
    pub fn get(&self, index: &str) -> Option<ShardState> {
        self.0.get(index).copied()
    }

    /// Sets or clears an index's state.
    pub fn set(&mut self, index: &str, state: Option<ShardState>) {
        match state {
            Some(state) => {
                self.0.insert(index.to_owned(), state);
            }
            None => {
                self.0.remove(index);
            }
        }
    }

    pub fn encode(&self) -> Result<String, ClusterError> {
        serde_json::to_string(self).map_err(|e| ClusterError::MalformedFact {
            slot: FactSlot::ShardStates,
            reason: e.to_string(),
        })
    }

    pub fn decode(value: &str) -> Result<Self, ClusterError> {
        serde_json::from_str(value).map_err(|e| ClusterError::MalformedFact {
            slot: FactSlot::ShardStates,
            reason: e.to_string(),
        })
    }
}
