//! The network function the queue delivers through.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::sync::{Headers, Method};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Connection-level failures are worth queueing; a server that answered
    /// with an error status is not.
    pub fn is_network_failure(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Unavailable(_) => true,
            Self::Status { .. } | Self::InvalidRequest(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub endpoint: String,
    pub method: Method,
    pub headers: Headers,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// The request layer must not put this request back on the queue if it fails.
    pub skip_queue: bool,
}

impl SendOptions {
    pub fn from_queue() -> Self {
        Self { skip_queue: true }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest, options: SendOptions) -> Result<(), TransportError>;
}

/// `reqwest`-backed transport. Relative endpoints are joined onto `base_url`.
pub struct HttpTransport {
    http: Client,
    base_url: Option<String>,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn resolve_url(&self, endpoint: &str) -> Result<String, TransportError> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(endpoint.to_string());
        }
        match &self.base_url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            )),
            None => Err(TransportError::InvalidRequest(format!(
                "relative endpoint {} with no base URL",
                endpoint
            ))),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest, options: SendOptions) -> Result<(), TransportError> {
        let url = self.resolve_url(&request.endpoint)?;
        let method = match request.method {
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        tracing::debug!(
            "{} {} (skip_queue={})",
            request.method,
            url,
            options.skip_queue
        );

        let mut builder = self.http.request(method, &url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("{} {} failed with {}", request.method, url, status);
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
