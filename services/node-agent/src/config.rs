//! Configuration for the node agent.

use std::path::PathBuf;

use anyhow::{Context, Result};
use cachefleet_agent_api::AgentCredential;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the agent API listens on.
    pub listen_addr: String,

    /// Host recorded on instances this node provisions.
    pub advertise_host: String,

    /// Maximum number of instances this node will hold.
    pub instance_limit: u32,

    /// Data directory for local state. `None` keeps instances in memory.
    pub data_dir: Option<PathBuf>,

    /// Credential callers must present.
    pub credential: AgentCredential,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr =
            var("CACHEFLEET_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8090".to_string());

        let advertise_host =
            var("CACHEFLEET_ADVERTISE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let instance_limit = match var("CACHEFLEET_INSTANCE_LIMIT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("CACHEFLEET_INSTANCE_LIMIT is not a count: {raw}"))?,
            None => 10,
        };

        let data_dir = var("CACHEFLEET_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let username = var("CACHEFLEET_AGENT_USERNAME").unwrap_or_else(|| "cachefleet".to_string());
        let password =
            var("CACHEFLEET_AGENT_PASSWORD").context("CACHEFLEET_AGENT_PASSWORD must be set")?;

        let log_level = var("CACHEFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            advertise_host,
            instance_limit,
            data_dir,
            credential: AgentCredential::new(username, password),
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("CACHEFLEET_AGENT_PASSWORD", "pw")])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8090");
        assert_eq!(config.instance_limit, 10);
        assert!(config.data_dir.is_none());
        assert_eq!(config.credential.username, "cachefleet");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CACHEFLEET_AGENT_PASSWORD", "pw"),
            ("CACHEFLEET_INSTANCE_LIMIT", "3"),
            ("CACHEFLEET_DATA_DIR", "/var/lib/cachefleet"),
            ("CACHEFLEET_ADVERTISE_HOST", "10.0.0.9"),
        ]))
        .unwrap();
        assert_eq!(config.instance_limit, 3);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/cachefleet")));
        assert_eq!(config.advertise_host, "10.0.0.9");
    }

    #[test]
    fn test_password_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_bad_limit() {
        let result = Config::from_lookup(lookup(&[
            ("CACHEFLEET_AGENT_PASSWORD", "pw"),
            ("CACHEFLEET_INSTANCE_LIMIT", "many"),
        ]));
        assert!(result.is_err());
    }
}
