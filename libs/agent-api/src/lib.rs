//! cachefleet agent contract.
//!
//! Everything both sides of the coordinator/node link agree on:
//!
//! - `types`: wire types (instances, credentials, resource snapshots)
//! - `error`: the error taxonomy and its HTTP mapping
//! - `provider`: the [`AgentApi`] contract served at every level of the fleet
//! - `router`: the HTTP surface exposing an [`AgentApi`]
//! - `auth`: the basic-auth guard in front of that surface

pub mod auth;
pub mod error;
pub mod provider;
pub mod router;
pub mod types;

pub use error::{ErrorBody, FleetError, FleetResult};
pub use provider::{AgentApi, NodeAgent};
pub use router::agent_router;
pub use types::{AgentCredential, Credential, Instance, ResourceSnapshot, ResourceStatus};
