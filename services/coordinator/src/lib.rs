//! cachefleet coordinator library.
//!
//! Presents a fleet of node agents as a single agent API:
//!
//! - `client`: [`NodeAgentClient`], HTTP client for one node agent
//! - `fleet`: [`FleetAggregator`], live fan-out over every node
//! - `cached`: [`CachedFleetAggregator`], the same contract from refreshed caches
//! - `placement`: choosing a node for a new instance
//! - `config`: environment configuration

pub mod cached;
pub mod client;
pub mod config;
pub mod fleet;
pub mod placement;

pub use cached::CachedFleetAggregator;
pub use client::NodeAgentClient;
pub use config::{Config, ConfigError, NodeEndpoint};
pub use fleet::FleetAggregator;
