//! HTTP exposure of the agent contract.
//!
//! | Method | Path | Success |
//! |---|---|---|
//! | GET | `/resources` | ResourceSnapshot |
//! | GET | `/all_instances` | `[Instance]` |
//! | GET | `/instance/{id}` | Instance, 404 when absent |
//! | GET | `/exist/{id}` | 200 or 404 |
//! | GET | `/credential/{id}` | Credential, 404 when absent |
//! | PUT | `/instance/{id}` | 200 |
//! | DELETE | `/instance/{id}` | 200 |
//!
//! Failures carry an [`ErrorBody`] and the status from
//! [`FleetError::status_code`].

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::require_basic_auth;
use crate::error::{ErrorBody, FleetError};
use crate::provider::AgentApi;
use crate::types::{AgentCredential, Instance};

/// State shared by the agent handlers.
#[derive(Clone)]
pub struct AgentState {
    provider: Arc<dyn AgentApi>,
}

/// Error wrapper turning a [`FleetError`] into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "Agent request failed");
        } else {
            debug!(code = self.0.code(), error = %self.0, "Agent request rejected");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// Build the authenticated agent router plus unauthenticated health probes.
pub fn agent_router(
    provider: Arc<dyn AgentApi>,
    credential: AgentCredential,
    service: &'static str,
) -> Router {
    let api = Router::new()
        .route("/resources", get(resources))
        .route("/all_instances", get(all_instances))
        .route(
            "/instance/{id}",
            get(instance_info)
                .put(provision_instance)
                .delete(unprovision_instance),
        )
        .route("/exist/{id}", get(instance_exists))
        .route("/credential/{id}", get(instance_credential))
        .route_layer(middleware::from_fn_with_state(
            Arc::new(credential),
            require_basic_auth,
        ))
        .with_state(AgentState { provider });

    Router::new()
        .merge(health_routes(service))
        .merge(api)
        .layer(TraceLayer::new_for_http())
}

async fn resources(State(state): State<AgentState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.provider.resources().await?;
    debug!(
        memory_free_mb = snapshot.memory.free,
        instances_free = snapshot.instances.free,
        "Served resources"
    );
    Ok(Json(snapshot))
}

async fn all_instances(State(state): State<AgentState>) -> Result<impl IntoResponse, ApiError> {
    let instances = state.provider.all_instances().await?;
    debug!(count = instances.len(), "Served instance listing");
    Ok(Json(instances))
}

async fn instance_info(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.provider.instance_info(&id).await? {
        Some(instance) => Ok(Json(instance)),
        None => Err(FleetError::InstanceNotFound(id).into()),
    }
}

async fn instance_exists(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.provider.instance_exists(&id).await? {
        Ok(StatusCode::OK)
    } else {
        debug!(instance_id = %id, "Instance not found");
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn instance_credential(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let credential = state.provider.instance_credential(&id).await?;
    Ok(Json(credential))
}

async fn provision_instance(
    State(state): State<AgentState>,
    Path(id): Path<String>,
    body: Result<Json<Instance>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(mut instance) = body.map_err(|rejection| {
        warn!(instance_id = %id, error = %rejection, "Malformed provision request");
        FleetError::InvalidRequest(rejection.body_text())
    })?;

    if instance.id.is_empty() {
        instance.id = id.clone();
    } else if instance.id != id {
        return Err(FleetError::InvalidRequest(format!(
            "path id {id} does not match body id {}",
            instance.id
        ))
        .into());
    }

    info!(
        instance_id = %instance.id,
        max_memory_mb = instance.max_memory_mb,
        max_clients = instance.max_clients,
        "Provisioning instance"
    );
    state.provider.provision_instance(instance).await?;
    Ok(StatusCode::OK)
}

async fn unprovision_instance(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!(instance_id = %id, "Unprovisioning instance");
    state.provider.unprovision_instance(&id).await?;
    Ok(StatusCode::OK)
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

fn health_routes(service: &'static str) -> Router {
    Router::new()
        .route(
            "/healthz",
            get(move || async move {
                Json(HealthResponse {
                    status: "ok".to_string(),
                    service: service.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                })
            }),
        )
        .route("/livez", get(|| async { StatusCode::OK }))
}
