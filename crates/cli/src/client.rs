//! API client for the collector agent

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for a single agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid agent URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request, failing on any non-success status
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.fetch(path).await?;

        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, body);
        }

        serde_json::from_str(&body).context("Failed to parse response")
    }

    /// Make a GET request and decode the body whatever the status.
    ///
    /// Health endpoints answer 503 with a regular JSON body.
    pub async fn get_with_status<T: DeserializeOwned>(&self, path: &str) -> Result<(StatusCode, T)> {
        let (status, body) = self.fetch(path).await?;
        let parsed = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse response ({})", status))?;
        Ok((status, parsed))
    }

    async fn fetch(&self, path: &str) -> Result<(StatusCode, String)> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read response")?;
        Ok((status, body))
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSummary {
    pub kind: String,
    pub index: usize,
    pub source: String,
    pub catalog: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub state: String,
    pub crash_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindCrashes {
    pub kind: String,
    pub panics: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_decodes_inputs() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/inputs")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"kind":"mysql","index":0,"source":"confd","catalog":"db",
                    "capabilities":["terminable"],"state":"running","crash_count":0}]"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let inputs: Vec<InputSummary> = client.get("v1/inputs").await.unwrap();

        mock.assert_async().await;
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].kind, "mysql");
        assert_eq!(inputs[0].capabilities, vec!["terminable"]);
    }

    #[tokio::test]
    async fn test_get_fails_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/inputs/crashes")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client
            .get::<Vec<KindCrashes>>("v1/inputs/crashes")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_get_with_status_keeps_unhealthy_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":"unhealthy","components":{"http":{"status":"unhealthy",
                    "message":"bind failed","last_check_timestamp":1700000000}}}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let (status, health): (StatusCode, HealthResponse) =
            client.get_with_status("healthz").await.unwrap();

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health.status, "unhealthy");
        assert_eq!(
            health.components["http"].message.as_deref(),
            Some("bind failed")
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
