//! HTTP client for a running daemon
//!
//! CLI subcommands other than `serve` talk to the daemon's REST API over
//! TCP, authenticated by the configured API key.

use anyhow::{Context, Result};
use serde_json::Value;

use mcpproxy_config::ProxyConfig;

/// Client bound to one daemon instance
pub struct DaemonClient {
    base: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl DaemonClient {
    /// Build from the loaded configuration
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base: format!("http://{}", config.listen),
            api_key: config.api_key.clone(),
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    async fn expect_success(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.context("daemon returned non-JSON")?;
        if !status.is_success() || body.get("success") == Some(&Value::Bool(false)) {
            let message = body
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed");
            anyhow::bail!("daemon error ({}): {}", status, message);
        }
        Ok(body)
    }

    /// GET an API path, returning the `data` payload
    pub async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("is the daemon running at {}?", self.base))?;
        let body = Self::expect_success(response).await?;
        Ok(body.get("data").cloned().unwrap_or(body))
    }

    /// POST an API path with a JSON body
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("is the daemon running at {}?", self.base))?;
        let body = Self::expect_success(response).await?;
        Ok(body.get("data").cloned().unwrap_or(body))
    }

    /// DELETE an API path
    pub async fn delete(&self, path: &str) -> Result<Value> {
        let response = self
            .request(reqwest::Method::DELETE, path)
            .send()
            .await
            .with_context(|| format!("is the daemon running at {}?", self.base))?;
        let body = Self::expect_success(response).await?;
        Ok(body.get("data").cloned().unwrap_or(body))
    }

    /// GET a path returning a raw (non-envelope) body, e.g. exports
    pub async fn get_raw(&self, path: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("is the daemon running at {}?", self.base))?;
        if !response.status().is_success() {
            anyhow::bail!("daemon returned HTTP {}", response.status());
        }
        Ok(response.text().await?)
    }
}
