//! Outbound request gate
//!
//! Every HTTP call to the backend goes through here. Attaches the bearer
//! credential, refreshes it first when it is about to expire, and ends the
//! session when the server rejects it.

use reqwest::Method;
use std::sync::Arc;

use crate::auth::{Credential, TokenState};
use crate::config::Config;
use crate::error::{CallKind, SyncError};

pub struct RequestGate {
    http: reqwest::Client,
    tokens: Arc<TokenState>,
    base_url: String,
    public_paths: Vec<String>,
}

impl RequestGate {
    pub fn new(
        base_url: &str,
        public_paths: Vec<String>,
        tokens: Arc<TokenState>,
        timeout: std::time::Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Unreachable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
            public_paths,
        })
    }

    pub fn from_config(config: &Config, tokens: Arc<TokenState>) -> Result<Self, SyncError> {
        Self::new(
            &config.api_base_url,
            config.public_paths.clone(),
            tokens,
            config.request_timeout(),
        )
    }

    /// Whether `path` is an allow-listed unauthenticated endpoint. Entries
    /// ending in `/` match as prefixes, others match the exact path or its
    /// subpaths.
    pub fn is_public(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.public_paths.iter().any(|p| {
            if p.ends_with('/') {
                path.starts_with(p.as_str())
            } else {
                path == p
                    || path
                        .strip_prefix(p.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        })
    }

    pub async fn get(&self, path: &str) -> Result<serde_json::Value, SyncError> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, SyncError> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, SyncError> {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<serde_json::Value, SyncError> {
        self.send(Method::DELETE, path, None).await
    }

    /// Send one request and decode its JSON body. An empty body decodes as
    /// `Null`.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, SyncError> {
        let url = format!("{}{}", self.base_url, path);

        if self.is_public(path) {
            tracing::debug!("{} {} (public)", method, url);
            let resp = self.request(method, &url, body).send().await?;
            return read_json(resp, CallKind::Login).await;
        }

        // A failed refresh has already ended the session; the request is
        // not forwarded.
        let credential = self.credential().await?;

        let mut req = self.request(method.clone(), &url, body);
        match credential {
            Some(ref c) => req = req.bearer_auth(c.access_token()),
            None => tracing::debug!("No credential for {} {}", method, url),
        }
        tracing::debug!("{} {}", method, url);
        let resp = req.send().await?;

        match read_json(resp, CallKind::Authenticated).await {
            Err(e @ SyncError::Unauthorized(_)) => {
                tracing::warn!("{} {} rejected: {}", method, url, e);
                self.tokens.end_session(&e);
                Err(e)
            }
            other => other,
        }
    }

    /// Credential to attach, refreshed first if it is near expiry.
    async fn credential(&self) -> Result<Option<Arc<Credential>>, SyncError> {
        let Some(current) = self.tokens.current() else {
            return Ok(None);
        };
        if !current.is_near_expiry(self.tokens.buffer()) {
            return Ok(Some(current));
        }

        tracing::debug!("Credential near expiry, refreshing before request");
        let fresh = self.tokens.refresh().await?;
        Ok(Some(fresh))
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match body {
            Some(b) => req.json(b),
            None => req,
        }
    }
}

/// Turn a response into JSON, or classify its failure status.
async fn read_json(
    resp: reqwest::Response,
    kind: CallKind,
) -> Result<serde_json::Value, SyncError> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(SyncError::from_status(status.as_u16(), &text, kind));
    }
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| SyncError::Protocol(format!("invalid JSON from server: {}", e)))
}
