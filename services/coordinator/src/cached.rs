//! Fleet view served from periodically refreshed caches.
//!
//! Reads never touch the network: resources and instance lists come from two
//! per-node caches that a background loop keeps current. Writes still go to
//! the owning node live, after which that node's cache entries are refreshed
//! so the next read sees the change.
//!
//! A cached view is never older than one refresh interval plus the duration
//! of one in-flight refresh pass. A node that stops answering keeps its last
//! good entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachefleet_agent_api::{
    AgentApi, Credential, FleetError, FleetResult, Instance, NodeAgent, ResourceSnapshot,
};
use cachefleet_cache::{Cache, CacheConfig, RefreshSource};
use tracing::{debug, warn};

use crate::fleet::{self, unique_instance, FleetAggregator};

/// Per-node resource snapshots.
struct ResourceSource {
    fleet: Arc<FleetAggregator>,
}

/// Per-node instance lists.
struct InstanceSource {
    fleet: Arc<FleetAggregator>,
}

fn hosts(fleet: &FleetAggregator) -> Vec<String> {
    fleet.nodes().iter().map(|node| node.host().to_string()).collect()
}

/// Call one node within the fan-out deadline, logging failures as misses.
async fn fetch<T, F>(fleet: &FleetAggregator, host: &str, what: &str, op: F) -> Option<T>
where
    F: for<'n> FnOnce(
        &'n dyn NodeAgent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = FleetResult<T>> + Send + 'n>>,
{
    let node = fleet.node(host)?;
    match tokio::time::timeout(fleet.fanout_timeout(), op(node.as_ref())).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(host = %host, what, error = %e, "Cache refresh failed for node");
            None
        }
        Err(_) => {
            warn!(host = %host, what, "Cache refresh timed out for node");
            None
        }
    }
}

#[async_trait]
impl RefreshSource<String, ResourceSnapshot> for ResourceSource {
    fn keys(&self) -> Vec<String> {
        hosts(&self.fleet)
    }

    async fn value(&self, host: &String) -> Option<ResourceSnapshot> {
        fetch(&self.fleet, host, "resources", |node| node.resources()).await
    }
}

#[async_trait]
impl RefreshSource<String, Vec<Instance>> for InstanceSource {
    fn keys(&self) -> Vec<String> {
        hosts(&self.fleet)
    }

    async fn value(&self, host: &String) -> Option<Vec<Instance>> {
        fetch(&self.fleet, host, "all_instances", |node| node.all_instances()).await
    }
}

/// [`AgentApi`] over cached per-node views of a [`FleetAggregator`].
pub struct CachedFleetAggregator {
    fleet: Arc<FleetAggregator>,
    resources: Cache<String, ResourceSnapshot>,
    instances: Cache<String, Vec<Instance>>,
}

impl CachedFleetAggregator {
    pub fn new(fleet: Arc<FleetAggregator>, refresh_interval: Duration) -> Self {
        let resources = Cache::<String, ResourceSnapshot>::new(
            CacheConfig {
                name: "node_resources",
                auto_refresh: true,
                refresh_interval,
            },
            Arc::new(ResourceSource {
                fleet: Arc::clone(&fleet),
            }),
        );
        let instances = Cache::<String, Vec<Instance>>::new(
            CacheConfig {
                name: "node_instances",
                auto_refresh: true,
                refresh_interval,
            },
            Arc::new(InstanceSource {
                fleet: Arc::clone(&fleet),
            }),
        );

        Self {
            fleet,
            resources,
            instances,
        }
    }

    /// Populate both caches and start their refresh loops.
    pub async fn start(&self) {
        tokio::join!(self.resources.start(), self.instances.start());
    }

    /// Stop both refresh loops. No-op when not started.
    pub async fn stop(&self) {
        tokio::join!(self.resources.stop(), self.instances.stop());
    }

    pub async fn is_running(&self) -> bool {
        self.resources.is_running().await && self.instances.is_running().await
    }

    /// Cached snapshots of the nodes that have answered at least once, in
    /// configuration order.
    pub async fn node_resources(&self) -> Vec<(String, ResourceSnapshot)> {
        let mut snapshots = Vec::with_capacity(self.fleet.nodes().len());
        for host in hosts(&self.fleet) {
            if let Some(snapshot) = self.resources.get(&host).await {
                snapshots.push((host, snapshot));
            }
        }
        snapshots
    }

    async fn node_instances(&self) -> Vec<(String, Vec<Instance>)> {
        let mut views = Vec::with_capacity(self.fleet.nodes().len());
        for host in hosts(&self.fleet) {
            if let Some(instances) = self.instances.get(&host).await {
                views.push((host, instances));
            }
        }
        views
    }

    async fn refresh_node(&self, host: &String) {
        tokio::join!(
            self.resources.refresh_key(host),
            self.instances.refresh_key(host)
        );
        debug!(host = %host, "Refreshed cached node views");
    }

    fn node(&self, host: &str) -> FleetResult<&Arc<dyn NodeAgent>> {
        self.fleet
            .node(host)
            .ok_or_else(|| FleetError::InvalidRequest(format!("unknown node {host}")))
    }

    /// Owner of `id` per the cached views, as `(host, instance)`.
    async fn owner(&self, id: &str) -> FleetResult<Option<(String, Instance)>> {
        let views = self.node_instances().await;
        let matches: Vec<(&str, Instance)> = views
            .iter()
            .flat_map(|(host, instances)| {
                instances
                    .iter()
                    .filter(|instance| instance.id == id)
                    .map(move |instance| (host.as_str(), instance.clone()))
            })
            .collect();

        let owner_host = matches.first().map(|(host, _)| host.to_string());
        Ok(unique_instance(id, matches)?.and_then(|instance| owner_host.map(|h| (h, instance))))
    }
}

#[async_trait]
impl AgentApi for CachedFleetAggregator {
    async fn resources(&self) -> FleetResult<ResourceSnapshot> {
        Ok(self
            .node_resources()
            .await
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .sum())
    }

    async fn all_instances(&self) -> FleetResult<Vec<Instance>> {
        Ok(self
            .node_instances()
            .await
            .into_iter()
            .flat_map(|(_, instances)| instances)
            .collect())
    }

    async fn instance_info(&self, id: &str) -> FleetResult<Option<Instance>> {
        Ok(self.owner(id).await?.map(|(_, instance)| instance))
    }

    async fn instance_exists(&self, id: &str) -> FleetResult<bool> {
        Ok(self.owner(id).await?.is_some())
    }

    async fn instance_credential(&self, id: &str) -> FleetResult<Credential> {
        let Some((host, _)) = self.owner(id).await? else {
            return Err(FleetError::InstanceNotFound(id.to_string()));
        };
        self.node(&host)?.instance_credential(id).await
    }

    async fn provision_instance(&self, instance: Instance) -> FleetResult<()> {
        let snapshots = self.node_resources().await;
        let host = self
            .fleet
            .place(instance, snapshots.iter().map(|(host, s)| (host.as_str(), s)))
            .await?;
        self.refresh_node(&host).await;
        Ok(())
    }

    async fn unprovision_instance(&self, id: &str) -> FleetResult<()> {
        let Some((host, _)) = self.owner(id).await? else {
            debug!(instance_id = %id, "Instance not in cached views; nothing to remove");
            return Ok(());
        };
        let result = self.node(&host)?.unprovision_instance(id).await;
        self.refresh_node(&host).await;
        fleet::already_absent_ok(id, result)
    }
}
