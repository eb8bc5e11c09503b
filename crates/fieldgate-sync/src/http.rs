//! # HTTP Transport
//!
//! `POST {cloud_api_url}/api/v1/sync/{table}` with the envelope as JSON.
//! Any 2xx is delivered, 409 is a conflict, everything else fails the batch.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::transport::{SyncEnvelope, Transport, TransportAck};

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(settings: &SyncSettings) -> SyncResult<Self> {
        let base_url = settings.cloud_url()?;
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(concat!("fieldgate-edge-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpTransport {
            client,
            base_url,
            api_key: settings.cloud_api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, envelope: &SyncEnvelope) -> SyncResult<TransportAck> {
        let url = self.endpoint(&format!("api/v1/sync/{}", envelope.table))?;
        debug!(url = %url, records = envelope.record_count(), "Posting sync batch");

        let response = self
            .authorize(self.client.post(url))
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(TransportAck::Delivered);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            let remote = serde_json::from_str(&body).unwrap_or(Value::Null);
            return Ok(TransportAck::Conflict(remote));
        }

        Err(SyncError::HttpStatus {
            status: status.as_u16(),
            body,
        })
    }

    async fn health_check(&self) -> SyncResult<()> {
        let url = self.endpoint("health")?;
        let response = self.authorize(self.client.get(url)).send().await?;

        if response.status().is_success() {
            info!(base_url = %self.base_url, "Cloud API reachable");
            Ok(())
        } else {
            let status = response.status().as_u16();
            warn!(base_url = %self.base_url, status, "Cloud API health check failed");
            Err(SyncError::HttpStatus {
                status,
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
