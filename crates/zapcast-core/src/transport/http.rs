//! HTTP gateway transport
//!
//! Posts `{ number, text }` to `{base_url}/message/sendText/{instance}` with
//! the gateway key in the `apikey` header.

use super::{
    FailureClassifier, FailureKind, OutboundMessage, RequestFailure, SendOutcome,
    StatusClassifier, Transport,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zapcast_common::config::TransportConfig;
use zapcast_common::{Error, Result};
use zapcast_storage::models::Instance;

#[derive(Debug, Serialize)]
struct SendTextRequest<'a> {
    number: &'a str,
    text: &'a str,
}

/// HTTP transport
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    classifier: Arc<dyn FailureClassifier>,
}

impl HttpTransport {
    /// Create a transport with the default status classifier
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            classifier: Arc::new(StatusClassifier),
        })
    }

    /// Replace the failure classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    fn outcome(&self, kind: FailureKind, error: String) -> SendOutcome {
        match kind {
            FailureKind::Transient => SendOutcome::TransientError { error },
            FailureKind::Permanent => SendOutcome::PermanentError { error },
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, instance: &Instance, message: &OutboundMessage) -> SendOutcome {
        let url = format!("{}/message/sendText/{}", self.base_url, instance.name);
        let body = SendTextRequest {
            number: &message.recipient,
            text: &message.content,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let failure = if e.is_timeout() {
                    RequestFailure::Timeout
                } else if e.is_connect() {
                    RequestFailure::Connect
                } else {
                    RequestFailure::Other
                };
                warn!(
                    message_id = %message.message_id,
                    instance = %instance.name,
                    "Gateway request failed: {}", e
                );
                return self.outcome(
                    self.classifier.classify_request(failure),
                    format!("request failed: {}", e),
                );
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return self.outcome(
                self.classifier.classify_status(status.as_u16()),
                format!("gateway returned {}: {}", status, body),
            );
        }

        // Gateways answer with `{ "key": { "id": ... } }`; the id is optional
        let provider_message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.pointer("/key/id").and_then(|id| id.as_str()).map(String::from));

        debug!(
            message_id = %message.message_id,
            instance = %instance.name,
            "Message accepted by gateway"
        );

        SendOutcome::Delivered {
            provider_message_id,
        }
    }
}
