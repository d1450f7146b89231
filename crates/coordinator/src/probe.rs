//! Liveness probe for the tunneled service endpoint.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Answers "is the service behind this endpoint ready yet?".
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// One probe attempt. Connection errors and non-200 responses both
    /// mean "not yet"; only a 200 means ready.
    async fn check(&self, endpoint: &str) -> bool;
}

/// HTTP GET against the Appium status path.
pub struct HttpStatusProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpStatusProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            path: "/status".to_string(),
        }
    }
}

impl Default for HttpStatusProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for HttpStatusProbe {
    async fn check(&self, endpoint: &str) -> bool {
        let url = format!("{endpoint}{}", self.path);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(err) => {
                debug!(url = %url, error = %err, "probe attempt failed");
                false
            }
        }
    }
}
