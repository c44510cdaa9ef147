use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::providers::endpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub ok: bool,
    pub detail: String,
}

impl EndpointStatus {
    pub fn reachable(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Connectivity check run against self-hosted endpoints before a batch.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn check(&self, base_url: &str) -> EndpointStatus;
}

/// Probes an Ollama server by listing its models (`GET /api/tags`).
#[derive(Debug, Clone)]
pub struct OllamaProbe {
    client: Client,
}

impl OllamaProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EndpointProbe for OllamaProbe {
    async fn check(&self, base_url: &str) -> EndpointStatus {
        let url = endpoint(base_url, "api/tags");
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                EndpointStatus::reachable(format!("HTTP {}", response.status().as_u16()))
            }
            Ok(response) => EndpointStatus::unreachable(format!("HTTP {}", response.status())),
            Err(error) => EndpointStatus::unreachable(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let probe = OllamaProbe::new(Duration::from_secs(2)).unwrap();
        let status = probe.check("http://127.0.0.1:1").await;
        assert!(!status.ok);
        assert!(!status.detail.is_empty());
    }
}
