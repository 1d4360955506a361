//! Reverse-proxy collaborator: route registration for deployed projects

use async_trait::async_trait;
use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::errors::EngineError;

/// A route from a public domain to a local upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRequest {
    pub domain: String,
    pub upstream: String,
    pub tls: bool,
    pub http_redirect: bool,
    pub websocket: bool,
}

/// Route management capability of the reverse proxy
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Whether routes can be registered at all
    fn is_enabled(&self) -> bool {
        true
    }

    /// Create a host record and return its id
    async fn create_host(&self, host: &HostRequest) -> Result<i64, EngineError>;

    async fn delete_host(&self, host_id: i64) -> Result<(), EngineError>;

    /// Apply pending host changes
    async fn reload(&self) -> Result<(), EngineError>;
}

/// Used when no proxy is configured: nothing is ever registered
#[derive(Debug, Clone, Default)]
pub struct DisabledProxy;

#[async_trait]
impl ReverseProxy for DisabledProxy {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn create_host(&self, _host: &HostRequest) -> Result<i64, EngineError> {
        Err(EngineError::ProxyError(
            "reverse proxy is not configured".to_string(),
        ))
    }

    async fn delete_host(&self, _host_id: i64) -> Result<(), EngineError> {
        Ok(())
    }

    async fn reload(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CreatedHost {
    id: i64,
}

/// Talks to the proxy's JSON hosts API
pub struct HttpProxyClient {
    client: Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpProxyClient {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.filter(|t| !t.is_empty()).map(SecretString::from),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let request = self.client.request(method, &url);
        match &self.api_token {
            Some(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, EngineError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("Proxy {} failed: {} - {}", what, status, body);
        Err(EngineError::ProxyError(format!("{} failed: {}: {}", what, status, body)))
    }
}

#[async_trait]
impl ReverseProxy for HttpProxyClient {
    async fn create_host(&self, host: &HostRequest) -> Result<i64, EngineError> {
        let response = self
            .request(reqwest::Method::POST, "/hosts")
            .json(host)
            .send()
            .await?;
        let created: CreatedHost = Self::check(response, "create host").await?.json().await?;
        Ok(created.id)
    }

    async fn delete_host(&self, host_id: i64) -> Result<(), EngineError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/hosts/{}", host_id))
            .send()
            .await?;
        Self::check(response, "delete host").await?;
        Ok(())
    }

    async fn reload(&self) -> Result<(), EngineError> {
        let response = self.request(reqwest::Method::POST, "/reload").send().await?;
        Self::check(response, "reload").await?;
        Ok(())
    }
}
