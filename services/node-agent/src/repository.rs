//! Local instance repositories.
//!
//! The provider owns allocation and limits; a repository only stores what the
//! provider hands it. Two backends:
//! - [`InMemoryRepository`]: process-lifetime map, used when no data dir is set
//! - [`SqliteRepository`]: the [`StateStore`] behind a blocking-task boundary

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cachefleet_agent_api::{FleetError, FleetResult, Instance};
use tokio::sync::RwLock;
use tracing::debug;

use crate::state::{InstanceRecord, StateStore, StateStoreError};

/// Storage for the instances owned by this node.
#[async_trait]
pub trait LocalRepository: Send + Sync {
    async fn all_instances(&self) -> FleetResult<Vec<Instance>>;

    async fn find(&self, id: &str) -> FleetResult<Option<Instance>>;

    async fn exists(&self, id: &str) -> FleetResult<bool> {
        Ok(self.find(id).await?.is_some())
    }

    /// Store a new instance. `InstanceAlreadyExists` if the ID is taken.
    async fn insert(&self, instance: Instance) -> FleetResult<()>;

    /// Remove an instance. `InstanceNotFound` if absent.
    async fn remove(&self, id: &str) -> FleetResult<()>;
}

/// Map-backed repository. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    instances: RwLock<BTreeMap<String, Instance>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalRepository for InMemoryRepository {
    async fn all_instances(&self) -> FleetResult<Vec<Instance>> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn find(&self, id: &str) -> FleetResult<Option<Instance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn insert(&self, instance: Instance) -> FleetResult<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(FleetError::InstanceAlreadyExists(instance.id));
        }
        instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn remove(&self, id: &str) -> FleetResult<()> {
        match self.instances.write().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(FleetError::InstanceNotFound(id.to_string())),
        }
    }
}

/// SQLite-backed repository at `<data dir>/instances.db`.
#[derive(Clone)]
pub struct SqliteRepository {
    store: Arc<Mutex<StateStore>>,
}

impl SqliteRepository {
    pub const FILE_NAME: &'static str = "instances.db";

    /// Open (creating if needed) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> FleetResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            FleetError::Repository(format!("create {}: {e}", data_dir.display()))
        })?;
        let path = data_dir.join(Self::FILE_NAME);
        let store = StateStore::open(&path).map_err(store_error)?;
        debug!(path = %path.display(), "Opened instance store");
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: StateStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    async fn with_store<T, F>(&self, op: F) -> FleetResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&StateStore) -> Result<T, StateStoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|_| FleetError::Repository("instance store lock poisoned".to_string()))?;
            op(&guard).map_err(store_error)
        })
        .await
        .map_err(|e| FleetError::Repository(format!("store task failed: {e}")))?
    }
}

fn store_error(err: StateStoreError) -> FleetError {
    match err {
        StateStoreError::Duplicate(id) => FleetError::InstanceAlreadyExists(id),
        StateStoreError::NotFound(id) => FleetError::InstanceNotFound(id),
        other => FleetError::Repository(other.to_string()),
    }
}

#[async_trait]
impl LocalRepository for SqliteRepository {
    async fn all_instances(&self) -> FleetResult<Vec<Instance>> {
        let records = self.with_store(|store| store.list_instances()).await?;
        Ok(records.into_iter().map(|r| r.instance).collect())
    }

    async fn find(&self, id: &str) -> FleetResult<Option<Instance>> {
        let id = id.to_string();
        let record = self.with_store(move |store| store.get_instance(&id)).await?;
        Ok(record.map(|r| r.instance))
    }

    async fn insert(&self, instance: Instance) -> FleetResult<()> {
        let record = InstanceRecord {
            instance,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.with_store(move |store| store.insert_instance(&record))
            .await
    }

    async fn remove(&self, id: &str) -> FleetResult<()> {
        let id = id.to_string();
        self.with_store(move |store| store.delete_instance(&id)).await
    }
}
