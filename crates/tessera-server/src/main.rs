mod config;
mod identity;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tessera_cluster::{
    ClusterService, FileMetadataStore, MemoryConnector, MemoryGossip, MemoryMetadataStore,
    MetadataStore, NodeId,
};
use tracing::{info, warn};

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(name = "tessera-server", about = "tessera metadata convergence node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address this node announces in gossip
    #[arg(long, env = "TESSERA_ADDRESS")]
    address: Option<String>,

    /// directory for the host id and the metadata record. without it,
    /// metadata is kept in memory and a new host id is used on every start
    #[arg(long, env = "TESSERA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// rack announced in gossip
    #[arg(long, env = "TESSERA_RACK")]
    rack: Option<String>,

    /// name shared by every node of the cluster
    #[arg(long, env = "TESSERA_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// datacenter announced in gossip; only peers in the same one count
    #[arg(long, env = "TESSERA_DATACENTER")]
    datacenter: Option<String>,

    /// port peers accept node connections on
    #[arg(long, env = "TESSERA_TRANSPORT_PORT")]
    transport_port: Option<u16>,

    /// how long to wait for peers to acknowledge a metadata change
    #[arg(long, env = "TESSERA_ACK_TIMEOUT_MS")]
    ack_timeout_ms: Option<u64>,

    /// how long an index operation may wait in the update queue
    #[arg(long, env = "TESSERA_MASTER_TIMEOUT_MS")]
    master_timeout_ms: Option<u64>,

    /// interval between reconnect passes to unconnected alive nodes
    #[arg(long, env = "TESSERA_RECONNECT_INTERVAL_MS")]
    reconnect_interval_ms: Option<u64>,
}

/// Applies CLI overrides to a `NodeConfig`. Only `Some` values from the
/// CLI args take effect, which preserves the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut NodeConfig, args: &Args) {
    if let Some(ref address) = args.address {
        cfg.address = address.clone();
    }
    if let Some(ref dir) = args.data_dir {
        cfg.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(ref rack) = args.rack {
        cfg.rack = rack.clone();
    }
    if let Some(ref name) = args.cluster_name {
        cfg.cluster.cluster_name = name.clone();
    }
    if let Some(ref dc) = args.datacenter {
        cfg.cluster.datacenter = dc.clone();
    }
    if let Some(port) = args.transport_port {
        cfg.cluster.transport_port = port;
    }
    if let Some(v) = args.ack_timeout_ms {
        cfg.cluster.ack_timeout_ms = v;
    }
    if let Some(v) = args.master_timeout_ms {
        cfg.cluster.master_timeout_ms = v;
    }
    if let Some(v) = args.reconnect_interval_ms {
        cfg.cluster.reconnect_interval_ms = v;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Picks the metadata store and host id: file-backed with a stable id when
/// a data dir is configured, in-memory with a fresh id otherwise.
fn open_storage(cfg: &NodeConfig) -> (Arc<dyn MetadataStore>, NodeId) {
    match cfg.data_dir_path() {
        Some(dir) => {
            let host_id = identity::load_or_create(&dir)
                .unwrap_or_else(|e| exit_err(format!("failed to load host id: {e}")));
            let store = FileMetadataStore::new(&dir);
            info!(path = %store.path().display(), "metadata persistence enabled");
            (Arc::new(store), host_id)
        }
        None => {
            warn!("no data dir configured, metadata is kept in memory only");
            (Arc::new(MemoryMetadataStore::new()), NodeId::new())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match NodeConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // build NodeConfig: defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => NodeConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => NodeConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.validate() {
        exit_err(format!("invalid configuration: {e}"));
    }
    let ip = cfg.ip().unwrap_or_else(|e| exit_err(e));

    let (store, host_id) = open_storage(&cfg);

    let gossip = MemoryGossip::with_capacity(cfg.cluster.event_buffer);
    let handle = gossip.join(ip, host_id, &cfg.cluster.datacenter, &cfg.rack);

    let service = ClusterService::start(
        cfg.cluster.clone(),
        Arc::new(handle),
        store,
        Arc::new(MemoryConnector::new()),
    )
    .unwrap_or_else(|e| exit_err(format!("failed to start cluster service: {e}")));

    service.add_initial_state_listener(|state| {
        info!(
            version = state.version(),
            metadata = %state.metadata().revision(),
            indices = state.metadata().indices.len(),
            "node ready"
        );
    });

    info!(
        %host_id,
        address = %ip,
        cluster = %cfg.cluster.cluster_name,
        datacenter = %cfg.cluster.datacenter,
        "tessera node started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
    }
    service.shutdown().await;
}
