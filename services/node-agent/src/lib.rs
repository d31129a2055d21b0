//! cachefleet node agent library.
//!
//! The node agent runs on each cache host. It owns the instances placed on
//! that host, hands out their ports and secrets, and reports memory and slot
//! usage to the coordinator through the agent API.
//!
//! ## Modules
//!
//! - `provider`: [`NodeLocalProvider`], the agent contract over local state
//! - `repository`: in-memory and SQLite instance repositories
//! - `state`: SQLite instance store
//! - `resources`: host memory sampling
//! - `allocate`: port and secret allocation
//! - `config`: environment configuration

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

pub mod allocate;
pub mod config;
pub mod provider;
pub mod repository;
pub mod resources;
pub mod state;

pub use config::Config;
pub use provider::NodeLocalProvider;
pub use repository::{InMemoryRepository, LocalRepository, SqliteRepository};
pub use resources::{FixedMemory, MemoryReading, MemorySampler, SystemMemory};

/// Open the configured repository and build a provider over host memory.
pub fn build_provider(config: &Config) -> Result<NodeLocalProvider> {
    let repository: Arc<dyn LocalRepository> = match &config.data_dir {
        Some(dir) => {
            info!(data_dir = %dir.display(), "Using SQLite instance store");
            Arc::new(SqliteRepository::open(dir)?)
        }
        None => {
            info!("No data dir configured; instances are kept in memory");
            Arc::new(InMemoryRepository::new())
        }
    };

    Ok(NodeLocalProvider::new(
        repository,
        Arc::new(SystemMemory),
        config.instance_limit,
        config.advertise_host.clone(),
    ))
}
