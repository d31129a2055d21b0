//! Node-local implementation of the agent contract.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cachefleet_agent_api::{
    AgentApi, Credential, FleetError, FleetResult, Instance, ResourceSnapshot, ResourceStatus,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::allocate;
use crate::repository::LocalRepository;
use crate::resources::MemorySampler;

/// Largest memory reservation a node accepts, in MB. Reservations are
/// persisted as signed 64-bit integers.
pub const MAX_MEMORY_MB: u64 = i64::MAX as u64;

/// Serves [`AgentApi`] from this node's own repository and memory readings.
pub struct NodeLocalProvider {
    repository: Arc<dyn LocalRepository>,
    memory: Arc<dyn MemorySampler>,
    instance_limit: u32,
    advertise_host: String,
    /// Serializes check-allocate-insert so limits and ports hold under
    /// concurrent provisions.
    provision_lock: Mutex<()>,
}

impl NodeLocalProvider {
    pub fn new(
        repository: Arc<dyn LocalRepository>,
        memory: Arc<dyn MemorySampler>,
        instance_limit: u32,
        advertise_host: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            memory,
            instance_limit,
            advertise_host: advertise_host.into(),
            provision_lock: Mutex::new(()),
        }
    }

    pub fn instance_limit(&self) -> u32 {
        self.instance_limit
    }
}

#[async_trait]
impl AgentApi for NodeLocalProvider {
    async fn resources(&self) -> FleetResult<ResourceSnapshot> {
        let instances = self.repository.all_instances().await?;
        let reserved_mb = instances
            .iter()
            .map(|i| i.max_memory_mb)
            .fold(0, u64::saturating_add);
        let reading = self.memory.sample();

        let snapshot = ResourceSnapshot {
            memory: ResourceStatus::from_usage(
                reading.total_mb,
                reading.used_mb.saturating_add(reserved_mb),
            ),
            instances: ResourceStatus::from_usage(
                u64::from(self.instance_limit),
                instances.len() as u64,
            ),
        };

        debug!(
            os_used_mb = reading.used_mb,
            reserved_mb,
            instances = instances.len(),
            "Measured node resources"
        );
        Ok(snapshot)
    }

    async fn all_instances(&self) -> FleetResult<Vec<Instance>> {
        self.repository.all_instances().await
    }

    async fn instance_info(&self, id: &str) -> FleetResult<Option<Instance>> {
        self.repository.find(id).await
    }

    async fn instance_exists(&self, id: &str) -> FleetResult<bool> {
        self.repository.exists(id).await
    }

    async fn instance_credential(&self, id: &str) -> FleetResult<Credential> {
        self.repository
            .find(id)
            .await?
            .map(|instance| instance.credential())
            .ok_or_else(|| FleetError::InstanceNotFound(id.to_string()))
    }

    async fn provision_instance(&self, request: Instance) -> FleetResult<()> {
        if request.max_memory_mb > MAX_MEMORY_MB {
            return Err(FleetError::InvalidRequest(format!(
                "maxmemory {} MB for {} exceeds {MAX_MEMORY_MB} MB",
                request.max_memory_mb, request.id
            )));
        }

        let _guard = self.provision_lock.lock().await;

        let existing = self.repository.all_instances().await?;
        if existing.iter().any(|i| i.id == request.id) {
            return Err(FleetError::InstanceAlreadyExists(request.id));
        }
        if existing.len() >= self.instance_limit as usize {
            warn!(
                instance_id = %request.id,
                limit = self.instance_limit,
                "Instance limit reached"
            );
            return Err(FleetError::InstanceLimitReached {
                limit: self.instance_limit,
            });
        }

        let taken: HashSet<u16> = existing.iter().map(|i| i.port).collect();
        let instance = Instance {
            host: self.advertise_host.clone(),
            port: allocate::free_port(&taken)?,
            password: allocate::generate_password(),
            ..request
        };

        info!(
            instance_id = %instance.id,
            port = instance.port,
            max_memory_mb = instance.max_memory_mb,
            "Provisioned instance"
        );
        self.repository.insert(instance).await
    }

    async fn unprovision_instance(&self, id: &str) -> FleetResult<()> {
        let _guard = self.provision_lock.lock().await;
        self.repository.remove(id).await?;
        info!(instance_id = %id, "Unprovisioned instance");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::resources::FixedMemory;

    fn provider(limit: u32) -> NodeLocalProvider {
        NodeLocalProvider::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(FixedMemory::new(8192, 1024)),
            limit,
            "10.1.0.7",
        )
    }

    #[tokio::test]
    async fn test_resources_empty_node() {
        let provider = provider(4);
        let snapshot = provider.resources().await.unwrap();

        assert_eq!(snapshot.instances, ResourceStatus { all: 4, used: 0, free: 4 });
        assert_eq!(
            snapshot.memory,
            ResourceStatus { all: 8192, used: 1024, free: 7168 }
        );
    }

    #[tokio::test]
    async fn test_resources_count_reservations() {
        let provider = provider(4);
        provider
            .provision_instance(Instance::request("a", 512, 10))
            .await
            .unwrap();
        provider
            .provision_instance(Instance::request("b", 1024, 10))
            .await
            .unwrap();

        let snapshot = provider.resources().await.unwrap();
        assert_eq!(snapshot.instances, ResourceStatus { all: 4, used: 2, free: 2 });
        assert_eq!(snapshot.memory.used, 1024 + 512 + 1024);
        assert_eq!(snapshot.memory.free, 8192 - 2560);
    }

    #[tokio::test]
    async fn test_memory_free_saturates() {
        let provider = NodeLocalProvider::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(FixedMemory::new(1024, 900)),
            4,
            "10.1.0.7",
        );
        provider
            .provision_instance(Instance::request("big", 512, 1))
            .await
            .unwrap();

        let snapshot = provider.resources().await.unwrap();
        assert_eq!(snapshot.memory.used, 1412);
        assert_eq!(snapshot.memory.free, 0);
    }

    #[tokio::test]
    async fn test_oversized_reservation_rejected() {
        let provider = provider(4);
        let err = provider
            .provision_instance(Instance::request("huge", u64::MAX, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidRequest(_)));
        assert!(!provider.instance_exists("huge").await.unwrap());
    }

    #[tokio::test]
    async fn test_reservation_sum_saturates() {
        let provider = provider(4);
        for id in ["x", "y", "z"] {
            provider
                .provision_instance(Instance::request(id, MAX_MEMORY_MB, 1))
                .await
                .unwrap();
        }

        let snapshot = provider.resources().await.unwrap();
        assert_eq!(snapshot.memory.used, u64::MAX);
        assert_eq!(snapshot.memory.free, 0);
        assert_eq!(snapshot.instances.used, 3);
    }

    #[tokio::test]
    async fn test_provision_assigns_port_password_and_host() {
        let provider = provider(4);
        provider
            .provision_instance(Instance::request("cache-1", 256, 50))
            .await
            .unwrap();

        let instance = provider.instance_info("cache-1").await.unwrap().unwrap();
        assert_eq!(instance.host, "10.1.0.7");
        assert_ne!(instance.port, 0);
        assert_eq!(instance.password.len(), allocate::PASSWORD_LEN);
        assert_eq!(instance.max_memory_mb, 256);
        assert_eq!(instance.max_clients, 50);

        let credential = provider.instance_credential("cache-1").await.unwrap();
        assert_eq!(credential, instance.credential());
        assert!(provider.instance_exists("cache-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_provision_duplicate_rejected() {
        let provider = provider(4);
        provider
            .provision_instance(Instance::request("dup", 64, 1))
            .await
            .unwrap();

        let err = provider
            .provision_instance(Instance::request("dup", 64, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InstanceAlreadyExists(id) if id == "dup"));
    }

    #[tokio::test]
    async fn test_provision_limit_reached() {
        let provider = provider(1);
        provider
            .provision_instance(Instance::request("first", 64, 1))
            .await
            .unwrap();

        let err = provider
            .provision_instance(Instance::request("second", 64, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InstanceLimitReached { limit: 1 }));
        assert!(!provider.instance_exists("second").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_checked_before_limit() {
        let provider = provider(1);
        provider
            .provision_instance(Instance::request("only", 64, 1))
            .await
            .unwrap();

        let err = provider
            .provision_instance(Instance::request("only", 64, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InstanceAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_unprovision() {
        let provider = provider(2);
        provider
            .provision_instance(Instance::request("gone", 64, 1))
            .await
            .unwrap();

        provider.unprovision_instance("gone").await.unwrap();
        assert!(provider.instance_info("gone").await.unwrap().is_none());

        let err = provider.unprovision_instance("gone").await.unwrap_err();
        assert!(matches!(err, FleetError::InstanceNotFound(id) if id == "gone"));
    }

    #[tokio::test]
    async fn test_credential_missing_instance() {
        let provider = provider(2);
        let err = provider.instance_credential("nope").await.unwrap_err();
        assert!(matches!(err, FleetError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_provisions_respect_limit() {
        let provider = Arc::new(provider(3));
        let mut set = tokio::task::JoinSet::new();
        for n in 0..8 {
            let provider = Arc::clone(&provider);
            set.spawn(async move {
                provider
                    .provision_instance(Instance::request(format!("c-{n}"), 16, 1))
                    .await
            });
        }

        let mut ok = 0;
        while let Some(result) = set.join_next().await {
            match result.unwrap() {
                Ok(()) => ok += 1,
                Err(FleetError::InstanceLimitReached { limit: 3 }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 3);

        let ports: HashSet<u16> = provider
            .all_instances()
            .await
            .unwrap()
            .iter()
            .map(|i| i.port)
            .collect();
        assert_eq!(ports.len(), 3);
    }
}
