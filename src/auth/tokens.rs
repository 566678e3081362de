//! Credential type and expiry handling

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identity of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Access/refresh token pair with expiry and subject.
///
/// Immutable: a refresh yields a new `Credential`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    refresh_token: String,
    /// `None` when the expiry could not be decoded from the token.
    expires_at: Option<DateTime<Utc>>,
    subject: UserRef,
}

impl Credential {
    pub fn new(
        access_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
        subject: UserRef,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
            subject,
        }
    }

    /// Build a credential whose expiry comes from the access token's JWT
    /// `exp` claim.
    pub fn from_tokens(access_token: String, refresh_token: String, subject: UserRef) -> Self {
        let expires_at = decode_jwt_expiry(&access_token);
        Self::new(access_token, refresh_token, expires_at, subject)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn subject(&self) -> &UserRef {
        &self.subject
    }

    /// True once `now >= expires_at - buffer`. An undecodable expiry counts
    /// as near expiry.
    pub fn is_near_expiry(&self, buffer: Duration) -> bool {
        self.is_near_expiry_at(Utc::now(), buffer)
    }

    pub fn is_near_expiry_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let Some(exp) = self.expires_at else {
            return true;
        };
        let buffer = ChronoDuration::from_std(buffer).unwrap_or(ChronoDuration::MAX);
        match exp.checked_sub_signed(buffer) {
            Some(threshold) => now >= threshold,
            None => true,
        }
    }

    /// Seconds until the access token expires, if known.
    pub fn remaining(&self) -> Option<ChronoDuration> {
        self.expires_at.map(|exp| exp - Utc::now())
    }
}

/// Decode the `exp` claim (seconds since epoch) from a JWT without
/// verifying the signature.
pub fn decode_jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

#[cfg(test)]
pub(crate) fn fake_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{}}}"#, exp));
    format!("{}.{}.sig", header, payload)
}
