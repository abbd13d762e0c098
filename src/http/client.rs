//! HTTP client for asking the peer to stage a capture.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::pipeline::request::CaptureParams;

/// Talks to the peer's `/api/capture`.
#[derive(Debug, Clone)]
pub struct PeerClient {
    client: Client,
    /// e.g. `http://192.168.4.2:8080`
    base_url: String,
}

impl PeerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Forward the capture parameters so the peer reconfigures and arms.
    ///
    /// Non-2xx answers are [`PeerError::Refused`] with the peer's short reason.
    pub async fn prepare(&self, params: &CaptureParams) -> Result<(), PeerError> {
        let url = format!("{}/api/capture", self.base_url);
        debug!("Asking peer to prepare via {}", url);
        let response = self.client.post(&url).form(params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = response.text().await.unwrap_or_default().trim().to_string();
        warn!("Peer prepare refused ({}): {}", status, reason);
        Err(PeerError::Refused {
            status: status.as_u16(),
            reason,
        })
    }
}
