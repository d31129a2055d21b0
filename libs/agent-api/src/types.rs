//! Wire types shared by node agents and the coordinator.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// A provisioned cache-server instance.
///
/// The owning node assigns `port` and `password` at provision time. `host` is
/// omitted by nodes when they describe their own instances; the coordinator
/// stamps it with the address it reached the node on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub password: String,

    /// Memory reservation in MB.
    #[serde(rename = "maxmemory", default)]
    pub max_memory_mb: u64,

    /// Connection-count reservation.
    #[serde(rename = "maxclients", default)]
    pub max_clients: u32,
}

impl Instance {
    /// Build a provision request: identity plus reservations, everything else
    /// left for the owning node to assign.
    pub fn request(id: impl Into<String>, max_memory_mb: u64, max_clients: u32) -> Self {
        Self {
            id: id.into(),
            host: String::new(),
            port: 0,
            password: String::new(),
            max_memory_mb,
            max_clients,
        }
    }

    pub fn credential(&self) -> Credential {
        Credential {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
        }
    }
}

/// Connection details handed to consumers of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// A total/used/free counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub all: u64,
    pub used: u64,
    pub free: u64,
}

impl ResourceStatus {
    /// Counter with `free` derived from `all - used`, floored at zero.
    pub fn from_usage(all: u64, used: u64) -> Self {
        Self {
            all,
            used,
            free: all.saturating_sub(used),
        }
    }
}

impl Add for ResourceStatus {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            all: self.all.saturating_add(rhs.all),
            used: self.used.saturating_add(rhs.used),
            free: self.free.saturating_add(rhs.free),
        }
    }
}

impl AddAssign for ResourceStatus {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Per-node resource view: instance slots and memory in MB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory: ResourceStatus,
    pub instances: ResourceStatus,
}

impl ResourceSnapshot {
    /// Whether the node has at least one free instance slot.
    pub fn has_free_slot(&self) -> bool {
        self.instances.free > 0
    }

    /// Fraction of memory still free, or `None` when the node reports no memory.
    pub fn free_memory_fraction(&self) -> Option<f64> {
        if self.memory.all == 0 {
            return None;
        }
        Some(self.memory.free as f64 / self.memory.all as f64)
    }
}

impl Add for ResourceSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            memory: self.memory + rhs.memory,
            instances: self.instances + rhs.instances,
        }
    }
}

impl AddAssign for ResourceSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for ResourceSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl<'a> Sum<&'a ResourceSnapshot> for ResourceSnapshot {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Shared basic-auth secret between the coordinator and node agents.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentCredential {
    pub username: String,
    pub password: String,
}

impl AgentCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for AgentCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
