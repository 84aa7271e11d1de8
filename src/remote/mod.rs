use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const USER_AGENT: &str = "partner-offline/0.1";

/// Outcome classes of a failed remote call. Callers branch on the tag to tell
/// connectivity problems apart from a refusal by the authority.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("remote returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl TransportError {
    /// No answer from the authority at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    /// A 4xx the authority will keep refusing. 408 and 429 are excluded.
    pub fn is_client_rejection(&self) -> bool {
        match self {
            Self::Status { code, .. } => (400..500).contains(code) && *code != 408 && *code != 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// One call against the remote authority. `path` is relative to the base URL
/// and may carry a query string.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub idempotency_key: Option<String>,
}

impl RemoteRequest {
    pub fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            idempotency_key: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, None)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path, Some(body))
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path, Some(body))
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, None)
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[async_trait]
pub trait RemoteService: Send + Sync + Any {
    /// Issue `request`; a 2xx answer yields its JSON body (`null` when empty).
    async fn send(&self, request: RemoteRequest) -> std::result::Result<Value, TransportError>;

    /// Cheap reachability check.
    async fn probe(&self) -> bool;
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    probe_path: String,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("probe_path", &self.probe_path)
            .finish()
    }
}

impl RemoteClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = parse_base_url(base_url)?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|err| Error::InvalidRequest(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
            probe_path: "health".to_string(),
        })
    }

    pub fn from_config(cfg: &crate::config::Remote) -> Result<Self> {
        let client = Self::new(
            &cfg.base_url,
            Some(cfg.token.clone()),
            Duration::from_secs(cfg.timeout_secs),
        )?;
        Ok(client.with_probe_path(&cfg.probe_path))
    }

    pub fn with_probe_path(mut self, path: &str) -> Self {
        self.probe_path = path.trim_start_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn build_request(
        &self,
        request: &RemoteRequest,
    ) -> std::result::Result<reqwest::Request, TransportError> {
        let endpoint = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|err| TransportError::Network(format!("invalid request path: {err}")))?;
        let mut builder = self
            .http
            .request(request.method.clone(), endpoint)
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header("Content-Type", "application/json")
                .json(body);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl RemoteService for RemoteClient {
    async fn send(&self, request: RemoteRequest) -> std::result::Result<Value, TransportError> {
        let built = self.build_request(&request)?;
        debug!(method = %built.method(), url = %built.url(), "remote request");

        let res = self.http.execute(built).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(%body, "rate limited by remote");
            } else {
                warn!(%status, %body, "remote rejected request");
            }
            return Err(TransportError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let text = res.text().await?;
        decode_body(&text)
    }

    async fn probe(&self) -> bool {
        let request = RemoteRequest::get(self.probe_path.clone());
        let built = match self.build_request(&request) {
            Ok(built) => built,
            Err(err) => {
                warn!(%err, "cannot build probe request");
                return false;
            }
        };
        match self.http.execute(built).await {
            Ok(res) => res.status().is_success(),
            Err(err) => {
                debug!(%err, "connectivity probe failed");
                false
            }
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|err| Error::InvalidRequest(format!("invalid base url '{raw}': {err}")))
}

fn decode_body(text: &str) -> std::result::Result<Value, TransportError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|err| TransportError::Decode(err.to_string()))
}
