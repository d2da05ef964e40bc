//! blobfs-sync: replication tool for blobfs nodes.
//!
//! Supports:
//! - Inspecting a remote node (`info`)
//! - Local replication status (`status`)
//! - One-shot schema exchange and pulls, outside the server's scheduler
//! - Replication log display and pruning
//!
//! # Usage
//!
//! ```bash
//! # Who answers at this URL?
//! blobfs-sync info http://node-b:8080
//!
//! # Watermarks, peers and the last pull of the local node
//! blobfs-sync status --config blobfs.toml
//!
//! # Pull every configured (folder, source) pair once
//! blobfs-sync pull --config blobfs.toml
//!
//! # View replication log for one folder
//! blobfs-sync repl-log --config blobfs.toml --folder /docs
//!
//! # Drop log entries older than 30 days
//! blobfs-sync prune --config blobfs.toml --days 30
//! ```

mod replication_log;

use anyhow::{Result, anyhow};
use blobfs_core::{Compression, MetadataRepository, NodeConfig, PullReport, ReplicationLog};
use blobfs_http::{HttpTransport, NodeHandle};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "blobfs-sync")]
#[command(author = "blobfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "blobfs replication tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show identity and capabilities of a remote node
    Info {
        /// Base URL of the node (e.g. http://node-b:8080)
        url: String,
        /// Request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Display replication settings, peers and the latest pull
    Status {
        /// Node configuration file
        #[arg(short, long, default_value = "blobfs.toml")]
        config: PathBuf,
    },

    /// Exchange replication schemas with every known peer
    Exchange {
        /// Node configuration file
        #[arg(short, long, default_value = "blobfs.toml")]
        config: PathBuf,
    },

    /// Pull every configured (folder, source) pair once
    Pull {
        /// Node configuration file
        #[arg(short, long, default_value = "blobfs.toml")]
        config: PathBuf,
        /// Exchange schemas before pulling
        #[arg(long)]
        exchange: bool,
    },

    /// View replication log
    #[command(name = "repl-log")]
    ReplLog {
        /// Node configuration file
        #[arg(short, long, default_value = "blobfs.toml")]
        config: PathBuf,
        /// Only entries for this folder
        #[arg(long)]
        folder: Option<String>,
        /// Only entries pulled from this source node id
        #[arg(long)]
        source: Option<Uuid>,
        /// List skipped versions
        #[arg(short, long)]
        verbose: bool,
    },

    /// Remove replication log entries older than the given age
    Prune {
        /// Node configuration file
        #[arg(short, long, default_value = "blobfs.toml")]
        config: PathBuf,
        /// Keep entries younger than this many days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { url, timeout } => cmd_info(url, timeout).await,
        Commands::Status { config } => cmd_status(config),
        Commands::Exchange { config } => cmd_exchange(config).await,
        Commands::Pull { config, exchange } => cmd_pull(config, exchange).await,
        Commands::ReplLog {
            config,
            folder,
            source,
            verbose,
        } => cmd_repl_log(config, folder, source, verbose),
        Commands::Prune { config, days } => cmd_prune(config, days),
    }
}

fn load(config: &Path) -> Result<NodeConfig> {
    NodeConfig::load(config).map_err(|e| anyhow!("Failed to load {}: {}", config.display(), e))
}

async fn cmd_info(url: String, timeout: u64) -> Result<()> {
    let transport = HttpTransport::new(Duration::from_secs(timeout), Compression::None)?;
    let info = transport.get_info(&url).await?;

    println!("Node:             {}", info.node_name);
    println!("Node id:          {}", info.node_id);
    println!("Protocol version: {}", info.protocol_version);
    println!("Capabilities:     {}", info.capabilities.join(", "));
    Ok(())
}

fn cmd_status(config: PathBuf) -> Result<()> {
    let config = load(&config)?;
    let node = NodeHandle::open(&config)?;
    let metadata = node.engine.files().metadata().clone();
    let local = metadata.local_node()?;

    println!("Node '{}' ({})", local.name, local.unique_id);
    if let Some(url) = &local.url {
        println!("  Public URL: {}", url);
    }

    let nodes = metadata.nodes()?;
    let name_of = |id: i64| {
        nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| format!("#{}", id))
    };

    let settings = metadata.replication_settings(None)?;
    if settings.is_empty() {
        println!("\nNo replication settings.");
    } else {
        println!("\nReplication settings:");
        for setting in &settings {
            let folder = metadata
                .folder(setting.folder_id)?
                .map(|f| f.url)
                .unwrap_or_else(|| format!("#{}", setting.folder_id));
            println!(
                "  {:<24} {} <- {} | {} | since {}",
                folder,
                name_of(setting.target_node_id),
                name_of(setting.source_node_id),
                if setting.is_own { "own" } else { "learned" },
                setting.last_sync_time.format("%Y-%m-%d %H:%M:%S%.6f UTC"),
            );
        }
    }

    let now = Utc::now();
    println!("\nPeers:");
    for peer in nodes.iter().filter(|n| n.id != local.id) {
        let contact = peer
            .last_contact
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".into());
        let unreachable = if node.engine.is_unreachable(peer, now) {
            " (unreachable)"
        } else {
            ""
        };
        println!(
            "  {:<16} {} | {} | last contact {}{}",
            peer.name,
            peer.unique_id,
            peer.url.as_deref().unwrap_or("-"),
            contact,
            unreachable
        );
    }

    let log = ReplicationLog::new(&config.node.data_dir);
    if let Some(entry) = log.latest()? {
        println!("\nLatest Replication:");
        println!("  {}", replication_log::format_entry(&entry));
    }
    Ok(())
}

async fn cmd_exchange(config: PathBuf) -> Result<()> {
    let config = load(&config)?;
    let node = NodeHandle::open(&config)?;
    let exchanged = node.engine.exchange_all().await?;
    println!("Exchanged schemas with {} peer(s)", exchanged);
    Ok(())
}

async fn cmd_pull(config: PathBuf, exchange: bool) -> Result<()> {
    let config = load(&config)?;
    let node = NodeHandle::open(&config)?;
    if exchange {
        let exchanged = node.engine.exchange_all().await?;
        println!("Exchanged schemas with {} peer(s)", exchanged);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let results = node.engine.run_cycle(&cancel_rx, true).await?;
    if results.is_empty() {
        println!("Nothing to pull.");
        return Ok(());
    }

    let mut failed = 0;
    for result in &results {
        match result {
            Ok(report) => print_report(report),
            Err(e) => {
                failed += 1;
                println!("  FAILED: {}", e);
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{} of {} pull(s) failed", failed, results.len()));
    }
    Ok(())
}

fn print_report(report: &PullReport) {
    let status = if report.cancelled { " (cancelled)" } else { "" };
    println!(
        "  {} <- {} | {} applied, {} present, {} deleted, {} skipped | {}{}",
        report.folder_url,
        report.source_id,
        report.applied,
        report.present,
        report.deleted,
        report.skipped.len(),
        replication_log::format_size(report.bytes_transferred),
        status
    );
    println!(
        "    watermark {} -> {}",
        report.from_watermark.format("%Y-%m-%d %H:%M:%S%.6f UTC"),
        report.to_watermark.format("%Y-%m-%d %H:%M:%S%.6f UTC")
    );
}

fn cmd_repl_log(config: PathBuf, folder: Option<String>, source: Option<Uuid>, verbose: bool) -> Result<()> {
    let config = load(&config)?;
    let log = ReplicationLog::new(&config.node.data_dir);
    replication_log::print_repl_log(
        &log,
        folder.as_deref(),
        source,
        verbose,
        &mut std::io::stdout(),
    )
}

fn cmd_prune(config: PathBuf, days: i64) -> Result<()> {
    if days < 0 {
        return Err(anyhow!("--days must not be negative"));
    }
    let config = load(&config)?;
    let log = ReplicationLog::new(&config.node.data_dir);
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let removed = log.cleanup_before(cutoff)?;
    println!("Removed {} replication log entries older than {} days", removed, days);
    Ok(())
}
