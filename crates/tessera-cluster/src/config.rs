//! Cluster configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gossip::DEFAULT_EVENT_CAPACITY;
use crate::ClusterError;

/// Settings for the convergence core of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Name shared by every node of the cluster.
    pub cluster_name: String,
    /// Port peers accept node connections on. Node addresses are the gossip
    /// address combined with this port.
    pub transport_port: u16,
    /// Datacenter assumed for the local node when gossip has none.
    pub datacenter: String,
    /// How often to retry connections to alive nodes we are not connected to.
    pub reconnect_interval_ms: u64,
    /// Default time to wait for peers to acknowledge a metadata change.
    pub ack_timeout_ms: u64,
    /// Default time a structural task may wait in the queue.
    pub master_timeout_ms: u64,
    /// Capacity of the in-process gossip notification channel. A slower
    /// subscriber than this resynchronizes from scratch.
    pub event_buffer: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "tessera".into(),
            transport_port: 9300,
            datacenter: "DC1".into(),
            reconnect_interval_ms: 10_000,
            ack_timeout_ms: 30_000,
            master_timeout_ms: 30_000,
            event_buffer: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClusterConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn master_timeout(&self) -> Duration {
        Duration::from_millis(self.master_timeout_ms)
    }

    /// Rejects settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ClusterError::Configuration("cluster_name must not be empty".into()));
        }
        if self.transport_port == 0 {
            return Err(ClusterError::Configuration("transport_port must not be 0".into()));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(ClusterError::Configuration(
                "reconnect_interval_ms must be at least 1".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ClusterError::Configuration("event_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
