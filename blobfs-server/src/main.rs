//! blobfs server
//!
//! Runs one storage node: file API and delivery over HTTP, the replication
//! endpoints peers pull from, and the replication scheduler pulling from the
//! configured sources.

use anyhow::{Context, Result};
use blobfs_core::{ContainerConfig, ContainerRegistry, MetadataRepository, NodeConfig, SqliteMetadataStore};
use blobfs_http::NodeHandle;
use clap::{Parser, Subcommand};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blobfs")]
#[command(author = "blobfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Blob-backed replicated file store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the node
    Start {
        /// Node configuration file
        #[arg(short, long, default_value = "blobfs.toml")]
        config: PathBuf,

        /// Override the listen address from the configuration
        #[arg(short, long)]
        addr: Option<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a starter configuration and create the data directory
    Init {
        /// Data directory of the new node
        data_dir: PathBuf,

        /// Node name
        #[arg(short, long, default_value = "blobfs")]
        name: String,

        /// Where to write the configuration
        #[arg(short, long, default_value = "blobfs.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, addr, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let mut node_config = NodeConfig::load(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            if let Some(addr) = addr {
                node_config.node.listen = addr;
            }
            serve(node_config).await
        }

        Commands::Init { data_dir, name, config } => init(&data_dir, &name, &config),
    }
}

fn init(data_dir: &Path, name: &str, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let mut config = NodeConfig::default();
    config.node.name = name.to_string();
    config.node.data_dir = data_dir.to_path_buf();
    config.containers.push(ContainerConfig {
        name: "main".into(),
        path: data_dir.join("main").to_string_lossy().into_owned(),
        folder: "/".into(),
    });
    config.validate()?;
    std::fs::write(config_path, config.to_toml()?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    // Opening the store registers the local node id peers will refer to.
    let store = SqliteMetadataStore::open(&config.metadata_path(), config.storage.shard_count, name)?;
    let local = store.local_node()?;
    println!("Initialized node '{}' ({})", local.name, local.unique_id);
    println!("Configuration written to {}", config_path.display());
    println!("Start with: blobfs start --config {}", config_path.display());
    Ok(())
}

async fn serve(config: NodeConfig) -> Result<()> {
    info!("Starting blobfs node '{}'", config.node.name);
    info!("Data directory: {}", config.node.data_dir.display());

    let node = NodeHandle::open(&config)?;
    let state = Arc::new(node.app_state(&config));
    let engine = node.engine.clone();
    let registry = node.registry.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = tokio::spawn(engine.run(shutdown_rx.clone()));
    let refresher = tokio::spawn(refresh_loop(registry, config.refresh_interval(), shutdown_rx));

    let addr: SocketAddr = config
        .node
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.node.listen))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let state = state.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(move |req| blobfs_http::handle_request(req, state.clone())))
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    if let Err(e) = scheduler.await {
        error!("Replication scheduler panicked: {}", e);
    }
    if let Err(e) = refresher.await {
        error!("Blob refresher panicked: {}", e);
    }
    info!("Node stopped");
    Ok(())
}

/// Re-evaluate every open container's active blob set periodically
async fn refresh_loop(
    registry: Arc<ContainerRegistry>,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let managers = match registry.loaded() {
                    Ok(managers) => managers,
                    Err(e) => {
                        warn!("Failed to list containers: {}", e);
                        continue;
                    }
                };
                for manager in managers {
                    if manager.is_closed() {
                        continue;
                    }
                    if let Err(e) = manager.refresh_active_set() {
                        warn!("Active blob refresh failed: {}", e);
                    }
                }
            }
        }
    }
}
