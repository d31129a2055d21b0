//! HTTP client for one node agent.
//!
//! Speaks the agent API exposed by `agent_router` and maps responses back
//! onto [`FleetError`]:
//! - transport failures become `AgentUnreachable`
//! - error bodies with a known `code` become the matching typed variant
//! - any other non-success status becomes `AgentStatus`
//! - malformed success bodies become `Decode`
//!
//! Instances and credentials coming back from a node are stamped with the
//! host the client reached it on.

use async_trait::async_trait;
use cachefleet_agent_api::error::codes;
use cachefleet_agent_api::{
    AgentApi, Credential, ErrorBody, FleetError, FleetResult, Instance, NodeAgent,
    ResourceSnapshot,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NodeEndpoint;

/// Client for a single node agent.
#[derive(Debug, Clone)]
pub struct NodeAgentClient {
    client: reqwest::Client,
    endpoint: NodeEndpoint,
    base_url: Url,
}

impl NodeAgentClient {
    /// Build a client for `endpoint` with a per-request timeout.
    ///
    /// Node certificates are not verified: agents run on the cluster network
    /// with self-signed certificates and requests are authenticated with the
    /// shared credential.
    pub fn new(endpoint: NodeEndpoint, request_timeout: Duration) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| FleetError::InvalidRequest(format!("build HTTP client: {e}")))?;

        let base_url = Url::parse(&endpoint.base_url()).map_err(|e| {
            FleetError::InvalidRequest(format!("bad node address {}: {e}", endpoint.base_url()))
        })?;

        Ok(Self {
            client,
            endpoint,
            base_url,
        })
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    fn url(&self, segments: &[&str]) -> FleetResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                FleetError::InvalidRequest(format!("bad node address {}", self.base_url))
            })?
            .clear()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> FleetResult<RequestBuilder> {
        let url = self.url(segments)?;
        let credential = &self.endpoint.credential;
        Ok(self
            .client
            .request(method, url)
            .basic_auth(&credential.username, Some(&credential.password)))
    }

    async fn send(&self, builder: RequestBuilder) -> FleetResult<Response> {
        builder.send().await.map_err(|e| FleetError::AgentUnreachable {
            host: self.endpoint.host.clone(),
            message: e.to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> FleetResult<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| FleetError::AgentUnreachable {
                host: self.endpoint.host.clone(),
                message: e.to_string(),
            })?;
        serde_json::from_slice(&body).map_err(|e| FleetError::Decode {
            host: self.endpoint.host.clone(),
            message: e.to_string(),
        })
    }

    /// Turn a non-success response into the error it describes.
    async fn error_from(&self, response: Response) -> FleetError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
            let id = body.instance_id.clone().unwrap_or_default();
            match body.code.as_str() {
                codes::INSTANCE_NOT_FOUND => return FleetError::InstanceNotFound(id),
                codes::INSTANCE_ALREADY_EXISTS => return FleetError::InstanceAlreadyExists(id),
                codes::INSTANCE_LIMIT_REACHED => {
                    if let Some(limit) = body.limit {
                        return FleetError::InstanceLimitReached { limit };
                    }
                }
                _ => {}
            }
            return self.status_error(status, body.message);
        }

        self.status_error(status, text)
    }

    fn status_error(&self, status: StatusCode, message: String) -> FleetError {
        warn!(
            host = %self.endpoint.host,
            status = status.as_u16(),
            message = %message,
            "Node agent returned an error"
        );
        FleetError::AgentStatus {
            host: self.endpoint.host.clone(),
            status: status.as_u16(),
            message,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> FleetResult<T> {
        let response = self.send(self.request(Method::GET, segments)?).await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        self.decode(response).await
    }

    fn stamp(&self, mut instance: Instance) -> Instance {
        instance.host = self.endpoint.host.clone();
        instance
    }
}

#[async_trait]
impl AgentApi for NodeAgentClient {
    async fn resources(&self) -> FleetResult<ResourceSnapshot> {
        self.get_json(&["resources"]).await
    }

    async fn all_instances(&self) -> FleetResult<Vec<Instance>> {
        let instances: Vec<Instance> = self.get_json(&["all_instances"]).await?;
        Ok(instances.into_iter().map(|i| self.stamp(i)).collect())
    }

    async fn instance_info(&self, id: &str) -> FleetResult<Option<Instance>> {
        let response = self
            .send(self.request(Method::GET, &["instance", id])?)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let instance: Instance = self.decode(response).await?;
                Ok(Some(self.stamp(instance)))
            }
            _ => Err(self.error_from(response).await),
        }
    }

    async fn instance_exists(&self, id: &str) -> FleetResult<bool> {
        let response = self.send(self.request(Method::GET, &["exist", id])?).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.error_from(response).await),
        }
    }

    async fn instance_credential(&self, id: &str) -> FleetResult<Credential> {
        let response = self
            .send(self.request(Method::GET, &["credential", id])?)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(FleetError::InstanceNotFound(id.to_string())),
            status if status.is_success() => {
                let mut credential: Credential = self.decode(response).await?;
                credential.host = self.endpoint.host.clone();
                Ok(credential)
            }
            _ => Err(self.error_from(response).await),
        }
    }

    async fn provision_instance(&self, instance: Instance) -> FleetResult<()> {
        debug!(host = %self.endpoint.host, instance_id = %instance.id, "Provisioning on node");
        let builder = self
            .request(Method::PUT, &["instance", instance.id.as_str()])?
            .json(&instance);
        let response = self.send(builder).await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(())
    }

    async fn unprovision_instance(&self, id: &str) -> FleetResult<()> {
        debug!(host = %self.endpoint.host, instance_id = %id, "Unprovisioning on node");
        let response = self
            .send(self.request(Method::DELETE, &["instance", id])?)
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(())
    }
}

impl NodeAgent for NodeAgentClient {
    fn host(&self) -> &str {
        &self.endpoint.host
    }
}
