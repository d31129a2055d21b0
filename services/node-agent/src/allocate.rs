//! Port and secret allocation for new instances.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use cachefleet_agent_api::{FleetError, FleetResult};
use rand::distr::Alphanumeric;
use rand::Rng;

/// Length of generated instance passwords.
pub const PASSWORD_LEN: usize = 32;

/// Attempts before giving up on finding a port not already handed out.
const PORT_ATTEMPTS: usize = 16;

/// Ask the OS for a free TCP port, skipping ports already assigned locally.
///
/// The probe listener is dropped before returning, so the port is free at the
/// time of the call but not reserved.
pub fn free_port(taken: &HashSet<u16>) -> FleetResult<u16> {
    for _ in 0..PORT_ATTEMPTS {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| FleetError::Repository(format!("allocate port: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| FleetError::Repository(format!("allocate port: {e}")))?
            .port();
        if !taken.contains(&port) {
            return Ok(port);
        }
    }

    Err(FleetError::Repository(format!(
        "no unassigned port after {PORT_ATTEMPTS} attempts"
    )))
}

/// Random alphanumeric secret.
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_bindable() {
        let port = free_port(&HashSet::new()).unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).unwrap();
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
