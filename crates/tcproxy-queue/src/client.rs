//! Queue API client
//!
//! Only the reclaim call lives here; the task process reaches the rest of
//! the API through the proxy.

use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;
use tcproxy_core::{AuthScheme, Result, TaskClaim, TcProxyError};

use crate::coordinator::{Coordinator, QueueError, Reclaim};
use crate::hawk::authorization_header;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// reqwest-backed queue client
#[derive(Debug, Clone)]
pub struct QueueClient {
    http: reqwest::Client,
    api_base: String,
    scheme: AuthScheme,
}

impl QueueClient {
    /// Create a client for `<api_base>/queue/v1`
    pub fn new(api_base: impl Into<String>, scheme: AuthScheme) -> Result<Self> {
        Self::with_timeout(api_base, scheme, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client whose calls give up after `timeout`
    pub fn with_timeout(
        api_base: impl Into<String>,
        scheme: AuthScheme,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TcProxyError::Queue(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            scheme,
        })
    }

    /// URL of the reclaim endpoint for a run
    pub fn reclaim_url(&self, task_id: &str, run_id: u32) -> std::result::Result<Url, QueueError> {
        let url = format!(
            "{}/queue/v1/task/{}/runs/{}/reclaim",
            self.api_base, task_id, run_id
        );
        Url::parse(&url).map_err(|e| QueueError::Permanent {
            status: 0,
            message: format!("Invalid reclaim URL {}: {}", url, e),
        })
    }
}

#[async_trait]
impl Coordinator for QueueClient {
    async fn reclaim(&self, claim: &TaskClaim) -> std::result::Result<Reclaim, QueueError> {
        let url = self.reclaim_url(&claim.task_id, claim.run_id)?;
        let authorization = authorization_header(self.scheme, &claim.credentials, "POST", &url)
            .map_err(|e| QueueError::Signing(e.to_string()))?;

        tracing::debug!("Reclaiming task {} via {}", claim, url);

        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| QueueError::Transient(format!("Failed to send reclaim: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            return Err(QueueError::from_status(status.as_u16(), error_text));
        }

        response
            .json::<Reclaim>()
            .await
            .map_err(|e| QueueError::Decode(format!("Failed to parse reclaim response: {}", e)))
    }
}
