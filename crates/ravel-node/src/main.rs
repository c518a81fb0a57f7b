use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::watch;

use ravel_consensus::{EngineConfig, LocalEngine};
use ravel_server::{serve_client, serve_cluster, Gateway, GatewayConfig};
use ravel_storage::fjall::{FjallLogStorage, FjallStore};
use ravel_storage::snapshot::FileSnapshotStore;
use ravel_storage::KvStateMachine;

#[derive(clap::Parser, Debug)]
#[command(name = "ravel-node", about = "Ravel replicated KV node")]
struct Cli {
    #[arg(long)]
    node_id: String,
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    /// Also the address recorded for this node in the membership.
    #[arg(long, default_value = "0.0.0.0:17001")]
    cluster_addr: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "/var/lib/ravel")]
    data_dir: PathBuf,
    /// Form a single-voter cluster if this node has no membership yet.
    #[arg(long)]
    bootstrap: bool,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    snapshot_retain: usize,
}

#[derive(Debug, Deserialize)]
struct ConsensusConfig {
    apply_queue_capacity: usize,
    snapshot_threshold: u64,
    trailing_logs: u64,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    write_timeout_ms: u64,
    membership_timeout_ms: u64,
    snapshot_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    consensus: ConsensusConfig,
    server: ServerConfig,
    observability: ObservabilityConfig,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(config_path) = path {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    figment
        .merge(Env::prefixed("RAVEL_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn init_tracing(config: &ObservabilityConfig) {
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.log_level)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.observability);

    tracing::info!(
        node_id = %cli.node_id,
        client_addr = %cli.client_addr,
        cluster_addr = %cli.cluster_addr,
        bootstrap = cli.bootstrap,
        "node starting"
    );

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;
    let cluster_addr: SocketAddr = cli
        .cluster_addr
        .parse()
        .with_context(|| format!("invalid cluster_addr: {}", cli.cluster_addr))?;

    let node_dir = cli.data_dir.join(&cli.node_id);
    let raft_dir = node_dir.join("raft");
    std::fs::create_dir_all(&raft_dir)
        .with_context(|| format!("failed to create {}", raft_dir.display()))?;

    let store = FjallStore::open(&raft_dir).context("failed to open log storage")?;
    let log = Arc::new(FjallLogStorage(store));
    let snapshots = Arc::new(
        FileSnapshotStore::open(node_dir.join("snapshots"), config.storage.snapshot_retain)
            .await
            .context("failed to open snapshot store")?,
    );
    let fsm = Arc::new(KvStateMachine::new());

    let engine_config = EngineConfig {
        bootstrap: cli.bootstrap,
        apply_queue_capacity: config.consensus.apply_queue_capacity,
        snapshot_threshold: config.consensus.snapshot_threshold,
        trailing_logs: config.consensus.trailing_logs,
        ..EngineConfig::new(cli.node_id.clone(), cli.cluster_addr.clone())
    };
    let engine = Arc::new(
        LocalEngine::start(engine_config, fsm.clone(), log, snapshots)
            .await
            .context("failed to start consensus engine")?,
    );

    let gateway = Arc::new(Gateway::new(
        fsm,
        engine.clone(),
        GatewayConfig {
            write_timeout: Duration::from_millis(config.server.write_timeout_ms),
            membership_timeout: Duration::from_millis(config.server.membership_timeout_ms),
            snapshot_timeout: Duration::from_millis(config.server.snapshot_timeout_ms),
        },
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let servers = async {
        tokio::try_join!(
            serve_client(client_addr, gateway.clone(), stopped(stop_rx.clone())),
            serve_cluster(cluster_addr, gateway.clone(), stopped(stop_rx.clone())),
        )
    };
    tokio::pin!(servers);

    let served = tokio::select! {
        res = &mut servers => res.map(|_| ()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            let _ = stop_tx.send(true);
            servers.await.map(|_| ())
        }
    };

    engine.shutdown().await;
    tracing::info!("node stopped");
    served
}
