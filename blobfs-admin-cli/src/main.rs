//! blobfs administration CLI

mod verify;

use anyhow::{Context, Result, anyhow};
use blobfs_core::model::normalize_folder_url;
use blobfs_core::{
    ContainerRegistry, MetadataRepository, NodeConfig, SqliteMetadataStore, TokenService,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "blobfs-admin")]
#[command(author = "blobfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "blobfs node administration tool")]
struct Cli {
    /// Node configuration file
    #[arg(short, long, global = true, default_value = "blobfs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the local node, its containers and blobs
    Info,

    /// Verify blob contents against metadata
    Verify {
        /// Only this container
        #[arg(long)]
        container: Option<String>,
        /// Only print the summary
        #[arg(short, long)]
        quiet: bool,
    },

    /// Mint an access token for the file API
    Token {
        /// Identity recorded as the author of uploads
        #[arg(long)]
        security_id: Option<String>,
    },

    /// Issue a delivery link for a file
    Session {
        #[arg(long)]
        folder: String,
        #[arg(long)]
        name: String,
        /// Version id; defaults to the current version
        #[arg(long)]
        version: Option<Uuid>,
    },

    /// Close a container and all its blobs for good
    #[command(name = "close-container")]
    CloseContainer { name: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let store: Arc<dyn MetadataRepository> = Arc::new(SqliteMetadataStore::open(
        &config.metadata_path(),
        config.storage.shard_count,
        &config.node.name,
    )?);

    match cli.command {
        Commands::Info => cmd_info(store.as_ref()),
        Commands::Verify { container, quiet } => cmd_verify(store.as_ref(), container, quiet),
        Commands::Token { security_id } => {
            let tokens = TokenService::new(store, config.token_ttl());
            let token = tokens.mint_access_token(security_id)?;
            println!("Access token: {}", token.unique_id);
            println!("Expires:      {}", token.expires.format("%Y-%m-%d %H:%M:%S UTC"));
            Ok(())
        }
        Commands::Session {
            folder,
            name,
            version,
        } => cmd_session(store, &config, &folder, &name, version),
        Commands::CloseContainer { name } => {
            let container = store
                .container_by_name(&name)?
                .ok_or_else(|| anyhow!("No container named '{}'", name))?;
            let registry = ContainerRegistry::new(store, config.lifecycle_settings());
            registry.manager(container.id)?.close()?;
            println!("Container '{}' closed", name);
            Ok(())
        }
    }
}

fn cmd_info(store: &dyn MetadataRepository) -> Result<()> {
    let local = store.local_node()?;
    println!("Node '{}' ({})", local.name, local.unique_id);
    println!("  Shards: {}", store.shard_count());

    for container in store.containers()? {
        let folder = store
            .folder(container.folder_id)?
            .map(|f| f.url)
            .unwrap_or_default();
        println!(
            "\nContainer '{}' -> {} [{}]{}",
            container.name,
            folder,
            container.path,
            if container.closed { " (closed)" } else { "" }
        );
        for blob in store.blobs_in_container(container.id, true)? {
            println!(
                "  {:<40} {:>12} bytes{}",
                blob.name,
                blob.integrity_position,
                if blob.closed { "  closed" } else { "" }
            );
        }
    }
    Ok(())
}

fn cmd_verify(store: &dyn MetadataRepository, container: Option<String>, quiet: bool) -> Result<()> {
    let report = verify::verify_containers(store, container.as_deref())?;
    if quiet {
        println!("{}", if report.ok() { "OK" } else { "FAILED" });
    } else {
        print!("{}", report);
    }
    if !report.ok() {
        return Err(anyhow!("Verification failed!"));
    }
    Ok(())
}

fn cmd_session(
    store: Arc<dyn MetadataRepository>,
    config: &NodeConfig,
    folder: &str,
    name: &str,
    version: Option<Uuid>,
) -> Result<()> {
    let folder_url = normalize_folder_url(folder)?;
    let folder = store
        .folder_by_url(&folder_url)?
        .ok_or_else(|| anyhow!("No folder {}", folder_url))?;
    let file = store
        .file_by_name(folder.id, name)?
        .filter(|f| !f.deleted)
        .ok_or_else(|| anyhow!("No file {} in {}", name, folder_url))?;
    let version_id = match version {
        None => file.current_version_id,
        Some(id) => {
            let v = store
                .version(&id)?
                .ok_or_else(|| anyhow!("No version {}", id))?;
            if v.file_id != file.unique_id {
                return Err(anyhow!("Version {} does not belong to {}", id, name));
            }
            id
        }
    };

    let tokens = TokenService::new(store, config.token_ttl());
    let access = tokens.mint_access_token(None)?;
    let token = tokens.issue_file_token(&access, file.unique_id, version_id, &folder_url);
    println!("{}", token.session_link(&config.node.delivery_host));
    println!("Expires: {}", access.expires.format("%Y-%m-%d %H:%M:%S UTC"));
    Ok(())
}
