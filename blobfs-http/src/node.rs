//! Wiring of one node's components from its configuration.

use blobfs_core::{
    ContainerRegistry, FileManager, NodeConfig, ReplicationEngine, ReplicationLog, Result,
    SqliteMetadataStore, TokenService,
};
use std::sync::Arc;
use tracing::info;

use crate::{AppState, HttpTransport};

/// Opened node: metadata store, containers, replication engine and tokens
pub struct NodeHandle {
    pub registry: Arc<ContainerRegistry>,
    pub engine: Arc<ReplicationEngine>,
    pub tokens: Arc<TokenService>,
}

impl NodeHandle {
    /// Open the metadata store, reconcile containers with the configuration
    /// and apply the configured pulls.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let store = Arc::new(SqliteMetadataStore::open(
            &config.metadata_path(),
            config.storage.shard_count,
            &config.node.name,
        )?);
        let registry = Arc::new(ContainerRegistry::new(store.clone(), config.lifecycle_settings()));
        let managers = registry.reconcile(&config.containers)?;
        info!("{} container(s) open", managers.len());

        let files = Arc::new(FileManager::new(registry.clone())?);
        let tokens = Arc::new(TokenService::new(store, config.token_ttl()));
        let transport = Arc::new(HttpTransport::new(
            config.request_timeout(),
            config.replication.compression,
        )?);
        let engine = Arc::new(ReplicationEngine::new(
            files,
            transport,
            Some(ReplicationLog::new(&config.node.data_dir)),
            config.scheduler_settings(),
        ));
        engine.set_public_url(config.node.public_url.clone())?;
        let settings = engine.configure(&config.replicate)?;
        info!("{} replication pull(s) configured", settings.len());

        Ok(Self {
            registry,
            engine,
            tokens,
        })
    }

    pub fn app_state(&self, config: &NodeConfig) -> AppState {
        AppState::new(
            self.engine.clone(),
            self.tokens.clone(),
            config.node.delivery_host.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobfs_core::{ContainerConfig, MetadataRepository, PullConfig};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn config(dir: &TempDir) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.name = "a".into();
        config.node.data_dir = dir.path().to_path_buf();
        config.node.public_url = Some("http://a:8080".into());
        config.containers.push(ContainerConfig {
            name: "main".into(),
            path: dir.path().join("main").to_string_lossy().into_owned(),
            folder: "/".into(),
        });
        config
    }

    #[test]
    fn test_open_keeps_node_identity() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.replicate.push(PullConfig {
            folder: "/docs".into(),
            source_name: "b".into(),
            source_id: Uuid::new_v4(),
            source_url: "http://b:8080".into(),
            recursive: true,
            soft_delete: false,
        });

        let first = NodeHandle::open(&config).unwrap();
        let id = first.engine.files().local_node_id();
        let local = first.engine.files().metadata().local_node().unwrap();
        assert_eq!(local.url.as_deref(), Some("http://a:8080"));
        drop(first);

        let second = NodeHandle::open(&config).unwrap();
        assert_eq!(second.engine.files().local_node_id(), id);
        let settings = second.engine.files().metadata().replication_settings(Some(true)).unwrap();
        assert_eq!(settings.len(), 1);
    }
}
