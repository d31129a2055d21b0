//! The agent contract.
//!
//! The same contract is served by a single node (locally), by the remote
//! client bound to one node, and by the fleet aggregators one level up, so
//! callers never need to know whether they talk to one node or the fleet.

use async_trait::async_trait;

use crate::error::FleetResult;
use crate::types::{Credential, Instance, ResourceSnapshot};

/// Read/provision contract for cache-server instances.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Current slot and memory usage.
    async fn resources(&self) -> FleetResult<ResourceSnapshot>;

    /// Every instance known to this provider.
    async fn all_instances(&self) -> FleetResult<Vec<Instance>>;

    /// Look up one instance. `Ok(None)` means it does not exist here.
    async fn instance_info(&self, instance_id: &str) -> FleetResult<Option<Instance>>;

    /// Whether the instance exists. Transport failures are errors, never `false`.
    async fn instance_exists(&self, instance_id: &str) -> FleetResult<bool>;

    /// Connection details. A missing instance is `FleetError::InstanceNotFound`.
    async fn instance_credential(&self, instance_id: &str) -> FleetResult<Credential>;

    /// Create the instance, assigning its port and password.
    async fn provision_instance(&self, instance: Instance) -> FleetResult<()>;

    /// Remove the instance.
    async fn unprovision_instance(&self, instance_id: &str) -> FleetResult<()>;
}

/// An [`AgentApi`] bound to one fleet member, identified by its host.
pub trait NodeAgent: AgentApi {
    fn host(&self) -> &str;
}
