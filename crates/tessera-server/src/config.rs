//! Node configuration.
//!
//! Settings resolve in the order defaults → TOML file → env vars → CLI
//! flags. The TOML layout nests the convergence core settings under
//! `[cluster]`:
//!
//! ```toml
//! address = "10.0.0.1"
//! data_dir = "/var/lib/tessera"
//! rack = "RAC1"
//!
//! [cluster]
//! cluster_name = "tessera"
//! datacenter = "DC1"
//! ack_timeout_ms = 30000
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tessera_cluster::{ClusterConfig, DEFAULT_RACK};

/// Everything a node needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address this node announces in gossip.
    pub address: String,
    /// Directory for the host id and the metadata record. Empty keeps
    /// metadata in memory only.
    pub data_dir: String,
    /// Rack announced in gossip.
    pub rack: String,
    pub cluster: ClusterConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            data_dir: String::new(),
            rack: DEFAULT_RACK.into(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a config from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("failed to parse config file '{}': {e}", path.display()))
    }

    /// Serializes the config as TOML, e.g. for `--config-template`.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    pub fn data_dir_path(&self) -> Option<PathBuf> {
        (!self.data_dir.trim().is_empty()).then(|| PathBuf::from(&self.data_dir))
    }

    pub fn ip(&self) -> Result<IpAddr, String> {
        self.address
            .parse()
            .map_err(|e| format!("invalid address '{}': {e}", self.address))
    }

    /// Checks everything `main` relies on before starting.
    pub fn validate(&self) -> Result<(), String> {
        self.ip()?;
        if self.rack.trim().is_empty() {
            return Err("rack must not be empty".into());
        }
        self.cluster.validate().map_err(|e| e.to_string())
    }
}
