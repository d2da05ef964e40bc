//! Node configuration, read from TOML.
//!
//! ```toml
//! [node]
//! name = "node-a"
//! data_dir = "/var/lib/blobfs"
//! listen = "0.0.0.0:8080"
//! public_url = "http://node-a:8080"
//! delivery_host = "https://files.example.com/d"
//!
//! [[container]]
//! name = "main"
//! path = "/var/lib/blobfs/main"
//! folder = "/"
//!
//! [[replicate]]
//! folder = "/docs"
//! source_name = "node-b"
//! source_id = "6b0c2a48-..."
//! source_url = "http://node-b:8080"
//! ```
//!
//! Every other section is optional and falls back to defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::lifecycle::{
    DEFAULT_MAX_ACTIVE_BLOBS, DEFAULT_MAX_BLOB_SIZE, DEFAULT_STREAMING_FRACTION, LifecycleSettings,
};
use crate::model::{DEFAULT_SHARD_COUNT, normalize_folder_url};
use crate::registry::ContainerConfig;
use crate::replication::Compression;
use crate::sync::{PullConfig, SchedulerSettings};
use crate::token::DEFAULT_TOKEN_TTL_HOURS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// URL peers use to reach this node
    #[serde(default)]
    pub public_url: Option<String>,
    /// Prefix of session links
    #[serde(default = "default_delivery_host")]
    pub delivery_host: String,
}

fn default_node_name() -> String {
    "blobfs".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_delivery_host() -> String {
    "http://localhost:8080/d".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            data_dir: default_data_dir(),
            listen: default_listen(),
            public_url: None,
            delivery_host: default_delivery_host(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
}

fn default_shard_count() -> u32 {
    DEFAULT_SHARD_COUNT
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSection {
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u64,
    #[serde(default = "default_max_active_blobs")]
    pub max_active_blobs: usize,
    #[serde(default = "default_streaming_fraction")]
    pub streaming_fraction: f64,
    #[serde(default = "default_streaming_timeout_secs")]
    pub streaming_timeout_secs: u64,
    /// How often active sets are re-read from metadata
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_max_blob_size() -> u64 {
    DEFAULT_MAX_BLOB_SIZE
}

fn default_max_active_blobs() -> usize {
    DEFAULT_MAX_ACTIVE_BLOBS
}

fn default_streaming_fraction() -> f64 {
    DEFAULT_STREAMING_FRACTION
}

fn default_streaming_timeout_secs() -> u64 {
    30 * 60
}

fn default_refresh_interval_secs() -> u64 {
    5 * 60
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            max_blob_size: default_max_blob_size(),
            max_active_blobs: default_max_active_blobs(),
            streaming_fraction: default_streaming_fraction(),
            streaming_timeout_secs: default_streaming_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSection {
    #[serde(default = "default_fine_interval_secs")]
    pub fine_interval_secs: u64,
    #[serde(default = "default_coarse_interval_secs")]
    pub coarse_interval_secs: u64,
    #[serde(default = "default_unreachable_days")]
    pub unreachable_days: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Compression requested for file transfers
    #[serde(default)]
    pub compression: Compression,
}

fn default_fine_interval_secs() -> u64 {
    60
}

fn default_coarse_interval_secs() -> u64 {
    30 * 60
}

fn default_unreachable_days() -> i64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            fine_interval_secs: default_fine_interval_secs(),
            coarse_interval_secs: default_coarse_interval_secs(),
            unreachable_days: default_unreachable_days(),
            request_timeout_secs: default_request_timeout_secs(),
            compression: Compression::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokensSection {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

fn default_ttl_hours() -> i64 {
    DEFAULT_TOKEN_TTL_HOURS
}

impl Default for TokensSection {
    fn default() -> Self {
        Self {
            ttl_hours: DEFAULT_TOKEN_TTL_HOURS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub replication: ReplicationSection,
    #[serde(default)]
    pub tokens: TokensSection,
    #[serde(default, rename = "container")]
    pub containers: Vec<ContainerConfig>,
    #[serde(default, rename = "replicate")]
    pub replicate: Vec<PullConfig>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(StorageError::Config(msg));
        if self.node.name.trim().is_empty() {
            return err("node.name must not be empty".into());
        }
        if self.storage.shard_count == 0 {
            return err("storage.shard_count must be at least 1".into());
        }
        if self.lifecycle.max_active_blobs == 0 {
            return err("lifecycle.max_active_blobs must be at least 1".into());
        }
        if self.lifecycle.max_blob_size == 0 {
            return err("lifecycle.max_blob_size must be positive".into());
        }
        if !(self.lifecycle.streaming_fraction > 0.0 && self.lifecycle.streaming_fraction <= 1.0) {
            return err("lifecycle.streaming_fraction must be in (0, 1]".into());
        }
        if self.tokens.ttl_hours <= 0 {
            return err("tokens.ttl_hours must be positive".into());
        }

        let mut names = HashSet::new();
        let mut paths = HashSet::new();
        for container in &self.containers {
            normalize_folder_url(&container.folder)?;
            if !names.insert(container.name.as_str()) {
                return err(format!("duplicate container name '{}'", container.name));
            }
            if !paths.insert(container.path.as_str()) {
                return err(format!("duplicate container path '{}'", container.path));
            }
        }

        let mut pulls = HashSet::new();
        for pull in &self.replicate {
            let folder = normalize_folder_url(&pull.folder)?;
            if !pulls.insert((folder, pull.source_id)) {
                return err(format!(
                    "folder '{}' is replicated from {} more than once",
                    pull.folder, pull.source_id
                ));
            }
        }
        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.node.data_dir.join("metadata.db")
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            max_blob_size: self.lifecycle.max_blob_size,
            max_active_blobs: self.lifecycle.max_active_blobs,
            streaming_fraction: self.lifecycle.streaming_fraction,
            streaming_timeout: Duration::from_secs(self.lifecycle.streaming_timeout_secs),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            fine_interval: Duration::from_secs(self.replication.fine_interval_secs.max(1)),
            coarse_interval: Duration::from_secs(self.replication.coarse_interval_secs.max(1)),
            unreachable_after: chrono::Duration::days(self.replication.unreachable_days),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.refresh_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.request_timeout_secs)
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.tokens.ttl_hours)
    }
}
