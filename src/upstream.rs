//! Upstream Client
//!
//! OpenAI-compatible chat-completion client used by the dispatcher. The trait is the
//! seam tests replace; `HttpUpstream` talks to real providers over reqwest.

use crate::models::ChatCompletion;
use crate::routing::ResolvedRoute;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Raw upstream event-stream body.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Connection error: {0}")]
    Transport(String),

    /// Non-2xx answer; rendered the way OpenAI SDKs render API errors
    #[error("Error code: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Malformed upstream response: {0}")]
    Decode(String),

    /// Error object delivered inside an otherwise successful response
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Upstream stream interrupted: {0}")]
    Stream(String),
}

impl UpstreamError {
    /// Best-effort HTTP status for this failure (advisory only).
    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::Status { status, .. } => *status,
            other => extract_status_code(&other.to_string()),
        }
    }
}

static STATUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"Error code:\s*(\d+)", r#""code":\s*["']?(\d{3})["']?"#]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

/// Pull an HTTP status out of opaque error text, defaulting to 500.
pub fn extract_status_code(message: &str) -> u16 {
    STATUS_PATTERNS
        .iter()
        .find_map(|re| re.captures(message)?.get(1)?.as_str().parse().ok())
        .unwrap_or(500)
}

#[async_trait]
pub trait ChatUpstream: Send + Sync {
    /// Buffered completion.
    async fn complete(
        &self,
        route: &ResolvedRoute,
        credential: Option<&str>,
        body: &Value,
    ) -> Result<ChatCompletion, UpstreamError>;

    /// Open an event stream; resolves once response headers arrive.
    async fn stream(
        &self,
        route: &ResolvedRoute,
        credential: Option<&str>,
        body: &Value,
    ) -> Result<ByteStream, UpstreamError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_env() -> Self {
        Self::new(crate::util::build_http_client_from_env())
    }

    fn endpoint(route: &ResolvedRoute) -> String {
        format!("{}/chat/completions", route.base_url.trim_end_matches('/'))
    }

    async fn send(
        &self,
        route: &ResolvedRoute,
        credential: Option<&str>,
        body: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut rb = self
            .client
            .post(Self::endpoint(route))
            .header("content-type", "application/json")
            .json(body);
        if stream {
            rb = rb.header("accept", "text/event-stream");
        }
        if let Some(key) = credential {
            rb = rb.bearer_auth(key);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatUpstream for HttpUpstream {
    async fn complete(
        &self,
        route: &ResolvedRoute,
        credential: Option<&str>,
        body: &Value,
    ) -> Result<ChatCompletion, UpstreamError> {
        let resp = self.send(route, credential, body, false).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let completion: ChatCompletion =
            serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        if let Some(err) = &completion.error {
            return Err(UpstreamError::Provider(err.to_string()));
        }
        if completion.choices.is_empty() {
            return Err(UpstreamError::Decode("response has no choices".into()));
        }
        Ok(completion)
    }

    async fn stream(
        &self,
        route: &ResolvedRoute,
        credential: Option<&str>,
        body: &Value,
    ) -> Result<ByteStream, UpstreamError> {
        let resp = self.send(route, credential, body, true).await?;
        Ok(resp
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()))
            .boxed())
    }
}
