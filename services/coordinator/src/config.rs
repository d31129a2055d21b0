//! Configuration for the coordinator.

use std::collections::HashSet;
use std::time::Duration;

use cachefleet_agent_api::AgentCredential;
use thiserror::Error;

/// Errors found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },

    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("no nodes configured")]
    NoNodes,

    #[error("node {0} is configured more than once")]
    DuplicateNode(String),
}

/// How to reach one node agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
    pub credential: AgentCredential,
    /// `https` when true, plain `http` otherwise.
    pub tls: bool,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, port: u16, credential: AgentCredential, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            credential,
            tls,
        }
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the fleet API listens on.
    pub listen_addr: String,

    /// Node agents, in the order used for merging and tie-breaks.
    pub nodes: Vec<NodeEndpoint>,

    /// How often cached views are refreshed.
    pub refresh_interval: Duration,

    /// Per-request transport timeout for node calls.
    pub request_timeout: Duration,

    /// Overall deadline for one node's share of a fan-out.
    pub fanout_timeout: Duration,

    /// Serve from cached views instead of querying nodes per request.
    pub cached: bool,

    /// Credential callers of the fleet API must present.
    pub api_credential: AgentCredential,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let listen_addr =
            var("CACHEFLEET_LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let agent_port = parse_or(&var, "CACHEFLEET_AGENT_PORT", 8090u16)?;
        let tls = parse_bool_or(&var, "CACHEFLEET_AGENT_TLS", true)?;

        let agent_username =
            var("CACHEFLEET_AGENT_USERNAME").unwrap_or_else(|| "cachefleet".to_string());
        let agent_password = var("CACHEFLEET_AGENT_PASSWORD").ok_or(ConfigError::Missing {
            var: "CACHEFLEET_AGENT_PASSWORD",
        })?;
        let agent_credential = AgentCredential::new(agent_username, agent_password);

        let raw_nodes = var("CACHEFLEET_NODES").unwrap_or_default();
        let nodes = parse_nodes(&raw_nodes, agent_port, &agent_credential, tls)?;

        // The fleet API reuses the agent credential unless given its own.
        let api_credential = match var("CACHEFLEET_API_PASSWORD") {
            Some(password) => AgentCredential::new(
                var("CACHEFLEET_API_USERNAME").unwrap_or_else(|| agent_credential.username.clone()),
                password,
            ),
            None => agent_credential.clone(),
        };

        let config = Self {
            listen_addr,
            nodes,
            refresh_interval: Duration::from_millis(parse_or(
                &var,
                "CACHEFLEET_REFRESH_INTERVAL_MS",
                50u64,
            )?),
            request_timeout: Duration::from_millis(parse_or(
                &var,
                "CACHEFLEET_REQUEST_TIMEOUT_MS",
                5000u64,
            )?),
            fanout_timeout: Duration::from_millis(parse_or(
                &var,
                "CACHEFLEET_FANOUT_TIMEOUT_MS",
                10_000u64,
            )?),
            cached: parse_bool_or(&var, "CACHEFLEET_CACHED", true)?,
            api_credential,
            log_level: var("CACHEFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that every constructor must uphold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.host.as_str()) {
                return Err(ConfigError::DuplicateNode(node.host.clone()));
            }
        }

        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "CACHEFLEET_REFRESH_INTERVAL_MS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(())
    }
}

/// Parse a comma-separated `host` / `host:port` list.
fn parse_nodes(
    raw: &str,
    default_port: u16,
    credential: &AgentCredential,
    tls: bool,
) -> Result<Vec<NodeEndpoint>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, port) = match entry.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse().map_err(|e| ConfigError::Invalid {
                        var: "CACHEFLEET_NODES",
                        value: entry.to_string(),
                        reason: format!("bad port: {e}"),
                    })?;
                    (host, port)
                }
                None => (entry, default_port),
            };
            if host.is_empty() {
                return Err(ConfigError::Invalid {
                    var: "CACHEFLEET_NODES",
                    value: entry.to_string(),
                    reason: "empty host".to_string(),
                });
            }
            Ok(NodeEndpoint::new(host, port, credential.clone(), tls))
        })
        .collect()
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match var(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            var: key,
            value: other.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
