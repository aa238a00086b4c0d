//! SDX daemon: wires the engine to a TCP transport, a local database
//! directory, and the host's signal handling.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use sdx_core::schema::SchemaCatalog;
use sdx_core::{PeerId, SchemaId};
use sdx_crypto::identity::NodeIdentity;
use sdx_crypto::signing::IdentitySigner;
use sdx_node::metrics::NodeMetrics;
use sdx_node::policy::{EffectivePolicy, PolicyTable};
use sdx_node::service::{NodeService, NodeServiceParams};
use sdx_node::trust::{PeerRegistry, TrustLevel};
use sdx_node::NodeConfig;
use sdx_store::{Store, StoreOptions};
use sdx_transport_tcp::{TcpTransport, TcpTransportConfig};
use serde::Deserialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How often the peer registry and policy table sidecars are rewritten.
const SIDECAR_SAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "sdx-daemon", about = "Space-data exchange node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "sdx.toml")]
    config: PathBuf,
    /// Overrides the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Overrides the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
struct PeerEntry {
    peer_id: PeerId,
    addr: SocketAddr,
    /// Schemas this node forwards to the peer.
    #[serde(default)]
    schemas: Vec<String>,
    #[serde(default)]
    trust: Option<TrustLevel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DaemonConfig {
    data_dir: PathBuf,
    listen_addr: SocketAddr,
    /// Schemas this node validates and ingests.
    schemas: Vec<String>,
    /// Cap on total stored record bytes; unset means unbounded.
    max_store_bytes: Option<u64>,
    node: NodeConfig,
    peers: Vec<PeerEntry>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./sdx-data"),
            listen_addr: "0.0.0.0:7440".parse().expect("default addr parses"),
            schemas: vec![
                "OMM".to_string(),
                "CDM".to_string(),
                "TDM".to_string(),
                "CAT".to_string(),
            ],
            max_store_bytes: None,
            node: NodeConfig::default(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error("failed to read config {0}: {1}")]
    ConfigRead(PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ConfigParse(PathBuf, toml::de::Error),
    #[error("failed to create data dir {0}: {1}")]
    DataDir(PathBuf, std::io::Error),
    #[error("identity key unreadable: {0}")]
    Identity(#[from] sdx_crypto::identity::IdentityError),
    #[error("store unavailable: {0}")]
    Store(#[from] sdx_store::StoreError),
    #[error("transport bind failed: {0}")]
    Transport(sdx_transport::TransportError),
}

fn load_config(args: &Args) -> Result<DaemonConfig, DaemonError> {
    let mut config = if args.config.exists() {
        let raw = fs::read_to_string(&args.config)
            .map_err(|e| DaemonError::ConfigRead(args.config.clone(), e))?;
        toml::from_str(&raw).map_err(|e| DaemonError::ConfigParse(args.config.clone(), e))?
    } else {
        info!(path = %args.config.display(), "no config file, using defaults");
        DaemonConfig::default()
    };
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    Ok(config)
}

fn run(args: Args, shutdown: Arc<AtomicBool>) -> Result<(), DaemonError> {
    let config = load_config(&args)?;
    fs::create_dir_all(&config.data_dir)
        .map_err(|e| DaemonError::DataDir(config.data_dir.clone(), e))?;

    let identity = NodeIdentity::load_or_generate(config.data_dir.join("identity.key"))?;
    let signer: Arc<dyn IdentitySigner> = Arc::new(identity.key().clone());
    info!(peer = %identity.peer_id(), "identity loaded");

    let mut catalog = SchemaCatalog::new();
    for name in &config.schemas {
        catalog.register(SchemaId::from(name.as_str()));
    }
    let schemas: Vec<SchemaId> = catalog.schemas();

    let store = Arc::new(Store::open(
        config.data_dir.join("records.db"),
        StoreOptions {
            max_total_bytes: config.max_store_bytes,
            validator: None,
        },
    )?);

    let metrics = Arc::new(NodeMetrics::new());
    let registry = Arc::new(PeerRegistry::new(config.node.gate, Arc::clone(&metrics)));
    let peers_path = config.data_dir.join("peers.json");
    if let Err(e) = registry.load_if_present(&peers_path) {
        error!(error = %e, "peer registry unreadable, starting empty");
    }
    let policy = Arc::new(PolicyTable::new(EffectivePolicy::default()));
    let policy_path = config.data_dir.join("policy.json");
    if let Err(e) = policy.load_if_present(&policy_path) {
        error!(error = %e, "policy table unreadable, starting empty");
    }

    let transport = Arc::new(
        TcpTransport::bind(
            TcpTransportConfig {
                handshake_timeout: config.node.handshake_timeout,
                ..TcpTransportConfig::new(config.listen_addr)
            },
            Arc::clone(&signer),
        )
        .map_err(DaemonError::Transport)?,
    );
    info!(addr = %transport.local_addr(), "listening");

    for entry in &config.peers {
        transport.add_peer(entry.peer_id, entry.addr);
        if let Some(level) = entry.trust {
            registry.set_trust(entry.peer_id, level);
        }
    }

    let mut service = NodeService::start(NodeServiceParams {
        config: config.node.clone(),
        store,
        transport: Arc::clone(&transport) as Arc<dyn sdx_transport::StreamTransport>,
        validator: Arc::new(catalog),
        signer,
        registry: Arc::clone(&registry),
        policy: Arc::clone(&policy),
        metrics: Arc::clone(&metrics),
        schemas,
    });
    for entry in &config.peers {
        for schema in &entry.schemas {
            service.bus().set_remote_subscription(
                entry.peer_id,
                SchemaId::from(schema.as_str()),
                true,
            );
        }
    }

    let mut last_save = Instant::now();
    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
        if last_save.elapsed() >= SIDECAR_SAVE_INTERVAL {
            last_save = Instant::now();
            save_sidecars(&registry, &peers_path, &policy, &policy_path);
        }
    }

    info!("shutting down");
    service.shutdown();
    save_sidecars(&registry, &peers_path, &policy, &policy_path);
    Ok(())
}

fn save_sidecars(
    registry: &PeerRegistry,
    peers_path: &Path,
    policy: &PolicyTable,
    policy_path: &Path,
) {
    if let Err(e) = registry.save(peers_path) {
        error!(error = %e, "failed to persist peer registry");
    }
    if let Err(e) = policy.save(policy_path) {
        error!(error = %e, "failed to persist policy table");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(e) = flag::register(signal, Arc::clone(&shutdown)) {
            error!(signal, error = %e, "failed to register signal handler");
        }
    }

    if let Err(e) = run(Args::parse(), shutdown) {
        error!(error = %e, "fatal: daemon exiting");
        std::process::exit(1);
    }
}
