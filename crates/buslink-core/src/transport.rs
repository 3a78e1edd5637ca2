//! Probe transport.
//!
//! A probe is a plain request/response call. Its reply only tells us the
//! request was accepted; the server's acknowledgment arrives out of band on
//! the probe channel.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::error::TransportError;

/// Body of a heartbeat probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    /// Fixed marker payload.
    pub message: String,
    /// Scope identifier of the sender.
    pub pos_id: String,
}

impl ProbeRequest {
    /// Create a probe body.
    #[must_use]
    pub fn new(message: impl Into<String>, pos_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            pos_id: pos_id.into(),
        }
    }
}

/// Request/response transport used to deliver probes.
///
/// The heartbeat service gives each request one query interval to settle
/// and treats a request still pending after that as failed.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Deliver a probe to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the request fails or is rejected.
    async fn request(&self, endpoint: &str, body: &ProbeRequest) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: ProbeTransport + ?Sized> ProbeTransport for std::sync::Arc<T> {
    async fn request(&self, endpoint: &str, body: &ProbeRequest) -> Result<(), TransportError> {
        (**self).request(endpoint, body).await
    }
}

/// JSON-RPC 2.0 probe transport over HTTP.
///
/// Posts `{"jsonrpc":"2.0","method":"call","params":<probe>}` and treats an
/// `error` member in the reply as a rejected probe.
#[derive(Debug, Clone)]
pub struct JsonRpcProbeTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl JsonRpcProbeTransport {
    /// Create a transport for a server base URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Create a transport reusing an existing client.
    ///
    /// The client's own timeout applies; without one a request is only
    /// bounded by the heartbeat service.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(endpoint)
            .map_err(|source| TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                source,
            })
    }
}

/// The `error` member of a JSON-RPC reply, if it carries one.
///
/// Any non-null `error` rejects the probe. `code` defaults to 0 when absent
/// or not an integer; a bare string is taken as the message.
fn rpc_error(reply: &Value) -> Option<TransportError> {
    let error = reply.get("error").filter(|error| !error.is_null())?;
    let (code, message) = match error {
        Value::Object(body) => (
            body.get("code").and_then(Value::as_i64).unwrap_or(0),
            match body.get("message") {
                Some(Value::String(message)) => message.clone(),
                Some(other) if !other.is_null() => other.to_string(),
                _ => String::new(),
            },
        ),
        Value::String(message) => (0, message.clone()),
        other => (0, other.to_string()),
    };
    Some(TransportError::Rpc { code, message })
}

#[async_trait]
impl ProbeTransport for JsonRpcProbeTransport {
    #[tracing::instrument(skip(self, body), fields(pos_id = %body.pos_id))]
    async fn request(&self, endpoint: &str, body: &ProbeRequest) -> Result<(), TransportError> {
        let url = self.endpoint_url(endpoint)?;
        let envelope = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": body,
        });

        let response = self.client.post(url).json(&envelope).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let reply: Value = response.json().await?;
        if let Some(error) = rpc_error(&reply) {
            return Err(error);
        }

        tracing::trace!("Probe accepted");
        Ok(())
    }
}
