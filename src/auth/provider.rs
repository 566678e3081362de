//! Credential provider: login, refresh and logout against the auth API

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::tokens::{Credential, UserRef};
use crate::error::{CallKind, SyncError};

/// Login form
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Source of credentials. Implementations own the wire format.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<Credential, SyncError>;

    /// Exchange `previous`'s refresh token for a new credential. Fields the
    /// server omits (rotated refresh token, subject) carry over from
    /// `previous`.
    async fn refresh(&self, previous: &Credential) -> Result<Credential, SyncError>;

    async fn logout(&self, credential: &Credential) -> Result<(), SyncError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(alias = "token", alias = "access_token")]
    access_token: String,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<UserRef>,
}

/// Some deployments wrap payloads in `{"data": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenEnvelope {
    Wrapped { data: TokenResponse },
    Bare(TokenResponse),
}

impl TokenEnvelope {
    fn into_inner(self) -> TokenResponse {
        match self {
            TokenEnvelope::Wrapped { data } => data,
            TokenEnvelope::Bare(r) => r,
        }
    }
}

/// JSON-over-HTTP credential provider.
pub struct HttpCredentialProvider {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCredentialProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Unreachable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_tokens(
        &self,
        path: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
        kind: CallKind,
    ) -> Result<TokenResponse, SyncError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("Auth POST {}", url);

        let mut req = self.http.post(&url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), &body, kind));
        }

        let envelope: TokenEnvelope = resp.json().await?;
        Ok(envelope.into_inner())
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn login(&self, request: &LoginRequest) -> Result<Credential, SyncError> {
        if request.email.trim().is_empty() || request.password.is_empty() {
            return Err(SyncError::Validation(
                "email and password are required".to_string(),
            ));
        }

        let body = serde_json::to_value(request)?;
        let tokens = self
            .post_tokens("/auth/login", &body, None, CallKind::Login)
            .await?;

        let refresh_token = tokens.refresh_token.ok_or_else(|| {
            SyncError::Protocol("login response has no refresh token".to_string())
        })?;
        let subject = tokens
            .user
            .ok_or_else(|| SyncError::Protocol("login response has no user".to_string()))?;

        Ok(Credential::from_tokens(
            tokens.access_token,
            refresh_token,
            subject,
        ))
    }

    async fn refresh(&self, previous: &Credential) -> Result<Credential, SyncError> {
        if previous.refresh_token().is_empty() {
            return Err(SyncError::SessionExpired(
                "no refresh token available".to_string(),
            ));
        }

        let body = serde_json::json!({ "refreshToken": previous.refresh_token() });
        let tokens = self
            .post_tokens("/auth/refresh", &body, None, CallKind::Refresh)
            .await?;

        Ok(Credential::from_tokens(
            tokens.access_token,
            tokens
                .refresh_token
                .unwrap_or_else(|| previous.refresh_token().to_string()),
            tokens.user.unwrap_or_else(|| previous.subject().clone()),
        ))
    }

    async fn logout(&self, credential: &Credential) -> Result<(), SyncError> {
        let url = format!("{}/auth/logout", self.base_url);
        tracing::debug!("Auth POST {}", url);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(credential.access_token())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::from_status(
                status.as_u16(),
                &body,
                CallKind::Authenticated,
            ));
        }
        Ok(())
    }
}
