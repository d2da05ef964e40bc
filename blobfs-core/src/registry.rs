//! Process-wide container manager cache
//!
//! Owned by the composition root and handed to whoever needs a container.
//! The first access to a container builds its [`ContainerManager`]; later
//! accesses reuse it for the life of the process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::lifecycle::{ContainerManager, LifecycleSettings};
use crate::metadata::MetadataRepository;
use crate::model::{Container, Folder, normalize_folder_url, parent_folder_url};

/// A container as declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub path: String,
    /// Folder URL the container stores files for
    pub folder: String,
}

pub struct ContainerRegistry {
    metadata: Arc<dyn MetadataRepository>,
    settings: LifecycleSettings,
    managers: Mutex<HashMap<i64, Arc<ContainerManager>>>,
}

impl ContainerRegistry {
    pub fn new(metadata: Arc<dyn MetadataRepository>, settings: LifecycleSettings) -> Self {
        Self {
            metadata,
            settings,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataRepository> {
        &self.metadata
    }

    /// Manager for a persisted container, built on first access
    pub fn manager(&self, container_id: i64) -> Result<Arc<ContainerManager>> {
        let mut managers = self
            .managers
            .lock()
            .map_err(|_| StorageError::Database("container registry lock poisoned".into()))?;
        if let Some(manager) = managers.get(&container_id) {
            return Ok(manager.clone());
        }
        let container = self
            .metadata
            .container(container_id)?
            .ok_or_else(|| StorageError::NotFound(format!("container {}", container_id)))?;
        let manager = Arc::new(ContainerManager::open(
            container,
            self.metadata.clone(),
            self.settings.clone(),
        )?);
        managers.insert(container_id, manager.clone());
        Ok(manager)
    }

    /// Every manager built so far
    pub fn loaded(&self) -> Result<Vec<Arc<ContainerManager>>> {
        let managers = self
            .managers
            .lock()
            .map_err(|_| StorageError::Database("container registry lock poisoned".into()))?;
        Ok(managers.values().cloned().collect())
    }

    /// Container responsible for `folder`: the open container bound to the
    /// folder itself or to its nearest ancestor
    pub fn for_folder(&self, folder: &Folder) -> Result<Option<Arc<ContainerManager>>> {
        let containers: Vec<Container> = self
            .metadata
            .containers()?
            .into_iter()
            .filter(|c| !c.closed)
            .collect();
        let mut url = Some(folder.url.clone());
        while let Some(current) = url {
            let Some(candidate) = self.metadata.folder_by_url(&current)? else {
                url = parent_folder_url(&current);
                continue;
            };
            if let Some(container) = containers.iter().find(|c| c.folder_id == candidate.id) {
                return self.manager(container.id).map(Some);
            }
            url = parent_folder_url(&current);
        }
        Ok(None)
    }

    /// Create any missing folders on the path to `url`, top-down
    pub fn ensure_folder(&self, url: &str) -> Result<Folder> {
        ensure_folder(self.metadata.as_ref(), url)
    }

    /// Match configured containers against persisted ones.
    ///
    /// Each configured container is found by name, else by path, else
    /// created. A persisted container bound to a different folder than its
    /// configuration is a configuration error. Persisted containers no longer
    /// configured are closed.
    pub fn reconcile(&self, configured: &[ContainerConfig]) -> Result<Vec<Arc<ContainerManager>>> {
        let mut kept = Vec::new();
        for config in configured {
            let folder = self.ensure_folder(&config.folder)?;
            let existing = match self.metadata.container_by_name(&config.name)? {
                Some(c) => Some(c),
                None => self.metadata.container_by_path(&config.path)?,
            };
            let container_id = match existing {
                Some(container) => {
                    if container.folder_id != folder.id {
                        let persisted = self
                            .metadata
                            .folder(container.folder_id)?
                            .map(|f| f.url)
                            .unwrap_or_else(|| format!("#{}", container.folder_id));
                        return Err(StorageError::Config(format!(
                            "Container '{}' is bound to folder '{}' but configured for '{}'",
                            config.name, persisted, folder.url
                        )));
                    }
                    if container.closed {
                        warn!(container = %container.name, "Configured container is closed and stays read-only");
                    }
                    container.id
                }
                None => {
                    let mut container = Container {
                        id: 0,
                        folder_id: folder.id,
                        path: config.path.clone(),
                        name: config.name.clone(),
                        closed: false,
                    };
                    container.id = self.metadata.insert_container(&container)?;
                    info!(
                        container = %container.name,
                        folder = %folder.url,
                        "Registered container at {}",
                        container.path
                    );
                    container.id
                }
            };
            kept.push(container_id);
        }

        for container in self.metadata.containers()? {
            if !kept.contains(&container.id) && !container.closed {
                info!(container = %container.name, "Closing container removed from configuration");
                self.manager(container.id)?.close()?;
            }
        }

        kept.iter().map(|id| self.manager(*id)).collect()
    }
}

/// Create any missing folders on the path to `url`, top-down
pub fn ensure_folder(metadata: &dyn MetadataRepository, url: &str) -> Result<Folder> {
    let url = normalize_folder_url(url)?;
    if let Some(folder) = metadata.folder_by_url(&url)? {
        return Ok(folder);
    }
    let parent = match parent_folder_url(&url) {
        Some(parent_url) => Some(ensure_folder(metadata, &parent_url)?),
        None => None,
    };
    let name = url.rsplit('/').next().unwrap_or_default().to_string();
    let mut folder = Folder {
        id: 0,
        unique_id: uuid::Uuid::new_v4(),
        url,
        name,
        parent_id: parent.map(|p| p.id),
    };
    match metadata.insert_folder(&folder) {
        Ok(id) => folder.id = id,
        // Lost a race with another writer creating the same folder
        Err(StorageError::Duplicate(_)) => {
            return metadata
                .folder_by_url(&folder.url)?
                .ok_or_else(|| StorageError::NotFound(format!("folder {}", folder.url)));
        }
        Err(e) => return Err(e),
    }
    Ok(folder)
}
