//! Error taxonomy for fleet and node operations.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::types::Instance;

/// Result type for agent contract operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors raised by node agents, the remote client, and the fleet aggregators.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Transport-level failure reaching a node.
    #[error("agent {host} unreachable: {message}")]
    AgentUnreachable { host: String, message: String },

    /// The node answered with a non-success status.
    #[error("agent {host} returned status {status}: {message}")]
    AgentStatus {
        host: String,
        status: u16,
        message: String,
    },

    /// The node answered with a payload that could not be decoded.
    #[error("malformed response from agent {host}: {message}")]
    Decode { host: String, message: String },

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("instance {0} already exists")]
    InstanceAlreadyExists(String),

    #[error("instance limit of {limit} reached")]
    InstanceLimitReached { limit: u32 },

    /// The same instance ID was observed on more than one node. `first` is the
    /// first full record seen, when the lookup returned records.
    #[error("instance {id} found on multiple nodes: {}", .hosts.join(", "))]
    DuplicateInstance {
        id: String,
        hosts: Vec<String>,
        first: Option<Box<Instance>>,
    },

    #[error("no node has capacity for instance {id} ({requested_mb} MB)")]
    NoCapacity { id: String, requested_mb: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("local repository error: {0}")]
    Repository(String),
}

impl FleetError {
    /// Stable machine-readable code carried in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::AgentUnreachable { .. } => "agent_unreachable",
            FleetError::AgentStatus { .. } => "agent_error",
            FleetError::Decode { .. } => "decode_error",
            FleetError::InstanceNotFound(_) => codes::INSTANCE_NOT_FOUND,
            FleetError::InstanceAlreadyExists(_) => codes::INSTANCE_ALREADY_EXISTS,
            FleetError::InstanceLimitReached { .. } => codes::INSTANCE_LIMIT_REACHED,
            FleetError::DuplicateInstance { .. } => "duplicate_instance",
            FleetError::NoCapacity { .. } => "no_capacity",
            FleetError::InvalidRequest(_) => "invalid_request",
            FleetError::Repository(_) => "repository_error",
        }
    }

    /// HTTP status this error is exposed with on the agent surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FleetError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::InstanceAlreadyExists(_) => StatusCode::CONFLICT,
            FleetError::InstanceLimitReached { .. } | FleetError::NoCapacity { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FleetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FleetError::AgentUnreachable { .. } | FleetError::AgentStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
            FleetError::Decode { .. }
            | FleetError::DuplicateInstance { .. }
            | FleetError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error came from reaching or talking to a node, as opposed
    /// to a decision the node or fleet made about the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FleetError::AgentUnreachable { .. }
                | FleetError::AgentStatus { .. }
                | FleetError::Decode { .. }
        )
    }
}

/// Error codes that the remote client maps back to typed variants.
pub mod codes {
    pub const INSTANCE_NOT_FOUND: &str = "instance_not_found";
    pub const INSTANCE_ALREADY_EXISTS: &str = "instance_already_exists";
    pub const INSTANCE_LIMIT_REACHED: &str = "instance_limit_reached";
}

/// JSON body returned with every non-success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Limit carried by `instance_limit_reached`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Instance ID the error refers to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl From<&FleetError> for ErrorBody {
    fn from(err: &FleetError) -> Self {
        let (limit, instance_id) = match err {
            FleetError::InstanceLimitReached { limit } => (Some(*limit), None),
            FleetError::InstanceNotFound(id) | FleetError::InstanceAlreadyExists(id) => {
                (None, Some(id.clone()))
            }
            FleetError::DuplicateInstance { id, .. } | FleetError::NoCapacity { id, .. } => {
                (None, Some(id.clone()))
            }
            _ => (None, None),
        };

        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            limit,
            instance_id,
        }
    }
}
