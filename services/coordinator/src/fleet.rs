//! Live fleet view over every configured node agent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachefleet_agent_api::{
    AgentApi, Credential, FleetError, FleetResult, Instance, NodeAgent, ResourceSnapshot,
};
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::client::NodeAgentClient;
use crate::config::Config;
use crate::placement;

/// Fans every call out to all nodes and merges the answers.
///
/// Per-node failures are logged and left out of the result; a fleet with no
/// reachable node answers with an empty aggregate rather than an error.
pub struct FleetAggregator {
    nodes: Vec<Arc<dyn NodeAgent>>,
    fanout_timeout: Duration,
}

impl FleetAggregator {
    pub fn new(nodes: Vec<Arc<dyn NodeAgent>>, fanout_timeout: Duration) -> Self {
        Self {
            nodes,
            fanout_timeout,
        }
    }

    /// Build HTTP clients for every configured node.
    pub fn from_config(config: &Config) -> FleetResult<Self> {
        let nodes = config
            .nodes
            .iter()
            .map(|endpoint| {
                let client = NodeAgentClient::new(endpoint.clone(), config.request_timeout)?;
                Ok(Arc::new(client) as Arc<dyn NodeAgent>)
            })
            .collect::<FleetResult<Vec<_>>>()?;
        Ok(Self::new(nodes, config.fanout_timeout))
    }

    /// Nodes in configuration order.
    pub fn nodes(&self) -> &[Arc<dyn NodeAgent>] {
        &self.nodes
    }

    pub fn fanout_timeout(&self) -> Duration {
        self.fanout_timeout
    }

    pub fn node(&self, host: &str) -> Option<&Arc<dyn NodeAgent>> {
        self.nodes.iter().find(|node| node.host() == host)
    }

    /// Run `op` against every node concurrently, each bounded by the fan-out
    /// deadline. Results come back in configuration order.
    async fn fan_out<'a, T, F, Fut>(&'a self, op: F) -> Vec<(&'a str, FleetResult<T>)>
    where
        F: Fn(&'a dyn NodeAgent) -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let deadline = self.fanout_timeout;
        let calls = self.nodes.iter().map(|node| {
            let node: &'a dyn NodeAgent = node.as_ref();
            let call = op(node);
            async move {
                let result = match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(FleetError::AgentUnreachable {
                        host: node.host().to_string(),
                        message: format!("no response within {deadline:?}"),
                    }),
                };
                (node.host(), result)
            }
        });
        join_all(calls).await
    }

    /// Keep successful answers, logging the rest.
    fn successes<'a, T>(
        operation: &str,
        results: Vec<(&'a str, FleetResult<T>)>,
    ) -> Vec<(&'a str, T)> {
        results
            .into_iter()
            .filter_map(|(host, result)| match result {
                Ok(value) => Some((host, value)),
                Err(e) => {
                    warn!(host = %host, operation, error = %e, "Node call failed; skipping node");
                    None
                }
            })
            .collect()
    }

    /// Live resource snapshots of the reachable nodes, in configuration order.
    pub async fn node_resources(&self) -> Vec<(&str, ResourceSnapshot)> {
        let results = self.fan_out(|node| node.resources()).await;
        Self::successes("resources", results)
    }

    /// Place `instance` on the best node among `snapshots` and provision it
    /// there. Returns the chosen host.
    pub(crate) async fn place<'a, I>(&self, instance: Instance, snapshots: I) -> FleetResult<String>
    where
        I: IntoIterator<Item = (&'a str, &'a ResourceSnapshot)>,
    {
        let Some(host) = placement::select_target(snapshots, instance.max_memory_mb) else {
            warn!(
                instance_id = %instance.id,
                requested_mb = instance.max_memory_mb,
                "No node can take the instance"
            );
            return Err(FleetError::NoCapacity {
                id: instance.id,
                requested_mb: instance.max_memory_mb,
            });
        };
        let host = host.to_string();

        let node = self
            .node(&host)
            .ok_or_else(|| FleetError::InvalidRequest(format!("unknown node {host}")))?;

        info!(instance_id = %instance.id, host = %host, "Placing instance");
        node.provision_instance(instance).await?;
        Ok(host)
    }

    /// Resolve which node owns `id`, if any.
    pub(crate) async fn owner(&self, id: &str) -> FleetResult<Option<Instance>> {
        let results = self.fan_out(|node| node.instance_info(id)).await;
        let matches: Vec<(&str, Instance)> = Self::successes("instance_info", results)
            .into_iter()
            .filter_map(|(host, found)| found.map(|instance| (host, instance)))
            .collect();
        unique_instance(id, matches)
    }
}

/// Reduce per-node matches to at most one, flagging duplicates.
fn unique<T>(
    id: &str,
    mut matches: Vec<(&str, T)>,
    first: impl FnOnce(T) -> Option<Box<Instance>>,
) -> FleetResult<Option<T>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop().map(|(_, value)| value)),
        _ => {
            let hosts: Vec<String> = matches.iter().map(|(host, _)| host.to_string()).collect();
            error!(instance_id = %id, hosts = ?hosts, "Instance found on multiple nodes");
            let (_, value) = matches.swap_remove(0);
            Err(FleetError::DuplicateInstance {
                id: id.to_string(),
                hosts,
                first: first(value),
            })
        }
    }
}

/// Reduce `(host, found)` pairs from cached or live views.
pub(crate) fn unique_instance(
    id: &str,
    matches: Vec<(&str, Instance)>,
) -> FleetResult<Option<Instance>> {
    unique(id, matches, |instance| Some(Box::new(instance)))
}

#[async_trait]
impl AgentApi for FleetAggregator {
    async fn resources(&self) -> FleetResult<ResourceSnapshot> {
        let total = self
            .node_resources()
            .await
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .sum::<ResourceSnapshot>();
        debug!(
            memory_free_mb = total.memory.free,
            instances_free = total.instances.free,
            "Aggregated fleet resources"
        );
        Ok(total)
    }

    async fn all_instances(&self) -> FleetResult<Vec<Instance>> {
        let results = self.fan_out(|node| node.all_instances()).await;
        Ok(Self::successes("all_instances", results)
            .into_iter()
            .flat_map(|(_, instances)| instances)
            .collect())
    }

    async fn instance_info(&self, id: &str) -> FleetResult<Option<Instance>> {
        self.owner(id).await
    }

    async fn instance_exists(&self, id: &str) -> FleetResult<bool> {
        let results = self.fan_out(|node| node.instance_exists(id)).await;
        let matches: Vec<(&str, ())> = Self::successes("instance_exists", results)
            .into_iter()
            .filter(|(_, exists)| *exists)
            .map(|(host, _)| (host, ()))
            .collect();
        Ok(unique(id, matches, |_| None)?.is_some())
    }

    async fn instance_credential(&self, id: &str) -> FleetResult<Credential> {
        let results = self.fan_out(|node| node.instance_credential(id)).await;
        let matches: Vec<(&str, Credential)> = results
            .into_iter()
            .filter_map(|(host, result)| match result {
                Ok(credential) => Some((host, credential)),
                Err(FleetError::InstanceNotFound(_)) => None,
                Err(e) => {
                    warn!(host = %host, error = %e, "Node call failed; skipping node");
                    None
                }
            })
            .collect();
        unique(id, matches, |_| None)?.ok_or_else(|| FleetError::InstanceNotFound(id.to_string()))
    }

    async fn provision_instance(&self, instance: Instance) -> FleetResult<()> {
        let snapshots = self.node_resources().await;
        self.place(instance, snapshots.iter().map(|(host, s)| (*host, s)))
            .await
            .map(|_| ())
    }

    async fn unprovision_instance(&self, id: &str) -> FleetResult<()> {
        let Some(instance) = self.owner(id).await? else {
            debug!(instance_id = %id, "Instance not found on any node; nothing to remove");
            return Ok(());
        };

        let node = self
            .node(&instance.host)
            .ok_or_else(|| FleetError::InvalidRequest(format!("unknown node {}", instance.host)))?;
        already_absent_ok(id, node.unprovision_instance(id).await)
    }
}

/// Treat a node reporting `id` as gone during removal as a completed removal.
pub(crate) fn already_absent_ok(id: &str, result: FleetResult<()>) -> FleetResult<()> {
    match result {
        Err(FleetError::InstanceNotFound(_)) => {
            debug!(instance_id = %id, "Instance already gone from its node");
            Ok(())
        }
        other => other,
    }
}
