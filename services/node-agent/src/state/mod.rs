//! Local state persistence for node agent.
//!
//! This module provides SQLite-based storage for the instance records owned
//! by this node (identity, port, secret, reservations).

mod store;

pub use store::{InstanceRecord, StateStore, StateStoreError};
