//! JSON-over-HTTP coordinator transport.

use async_trait::async_trait;
use reqwest::{Client as ReqwestClient, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{Registration, RegistrationResponse};
use crate::domain::ports::CoordinatorClient;

/// Destination used for registration.
pub const REGISTER_DESTINATION: &str = "register";

/// Destination used for heartbeats.
pub const HEARTBEAT_DESTINATION: &str = "heartbeat";

/// Posts messages to `<base_url>/agent/v1/<destination>/<hostname>`.
pub struct HttpCoordinatorClient {
    /// Reusable HTTP client with connection pooling
    http_client: ReqwestClient,
    base_url: String,
    hostname: String,
}

impl HttpCoordinatorClient {
    /// Client for `base_url`; fails unless the url is http or https.
    pub fn new(base_url: &str, hostname: &str, timeout: Duration) -> AgentResult<Self> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AgentError::Config(format!(
                "coordinator url must start with http:// or https://, got '{base_url}'"
            )));
        }
        let http_client = ReqwestClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            hostname: hostname.to_string(),
        })
    }

    fn url(&self, destination: &str) -> String {
        format!("{}/agent/v1/{destination}/{}", self.base_url, self.hostname)
    }

    async fn read_json(response: Response) -> AgentResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = format!("coordinator returned {status}: {body}");
            // Server-side failures are worth retrying; client errors are not.
            return Err(if status.is_server_error() {
                AgentError::Connectivity(message)
            } else {
                AgentError::Protocol(message)
            });
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("invalid coordinator response: {e}")))
    }
}

fn transport_error(err: &reqwest::Error) -> AgentError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        AgentError::Connectivity(err.to_string())
    } else {
        AgentError::Protocol(err.to_string())
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn connect(&self) -> AgentResult<()> {
        let response = self
            .http_client
            .get(format!("{}/agent/v1/ping", self.base_url))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::Connectivity(format!(
                "coordinator ping returned {}",
                response.status()
            )))
        }
    }

    #[instrument(skip(self, registration), fields(hostname = %registration.hostname))]
    async fn register(&self, registration: &Registration) -> AgentResult<RegistrationResponse> {
        let reply = self
            .send(&serde_json::to_value(registration)?, REGISTER_DESTINATION)
            .await?;
        serde_json::from_value(reply)
            .map_err(|e| AgentError::Protocol(format!("invalid registration response: {e}")))
    }

    async fn send(&self, message: &Value, destination: &str) -> AgentResult<Value> {
        let url = self.url(destination);
        debug!(%url, "sending message to coordinator");
        let response = self
            .http_client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        Self::read_json(response).await
    }
}
