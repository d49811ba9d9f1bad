//! Short-lived signaling bearer tokens (C4).
//!
//! The directory is treated as an authenticated HTTP collaborator: the core
//! only depends on the [`TokenIssuer`] trait. A concrete `reqwest`-backed
//! implementation is provided behind the `net` feature for integrators who
//! don't want to write their own HTTP client glue.

use crate::error::TokenError;
use crate::ids::AgentId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A short-lived signaling bearer token.
///
/// Immutable once issued. Any copy may be used; callers are expected to
/// issue a fresh token per session attempt rather than cache this value
/// (spec §4.4: "No caching").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: DateTime<Utc>,
    raw_expires_at: String,
}

impl Token {
    /// Build a token from the raw `{ token, expires_at }` fields returned by
    /// the directory.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if `value` is empty or `raw_expires_at` does not
    /// parse as an RFC 3339 timestamp.
    pub fn parse(value: impl Into<String>, raw_expires_at: impl Into<String>) -> Result<Self, TokenError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(TokenError("directory returned an empty token".to_string()));
        }
        let raw_expires_at = raw_expires_at.into();
        let expires_at = DateTime::parse_from_rfc3339(&raw_expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| TokenError(format!("invalid expires_at {raw_expires_at:?}: {e}")))?;
        Ok(Self {
            value,
            expires_at,
            raw_expires_at,
        })
    }

    /// The bearer token value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The parsed expiry instant.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The raw, unparsed expiry string as returned by the directory.
    #[must_use]
    pub fn raw_expires_at(&self) -> &str {
        &self.raw_expires_at
    }
}

/// Directory collaborator capable of minting signaling bearer tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Issue a fresh signaling token scoped to `agent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if the directory request fails, or if the
    /// response is missing the token or expiry fields.
    async fn issue_signaling_token(&self, agent_id: &AgentId) -> Result<Token, TokenError>;
}

#[cfg(feature = "net")]
pub use net::ReqwestDirectoryClient;

#[cfg(feature = "net")]
mod net {
    use super::{Token, TokenError, TokenIssuer};
    use crate::ids::AgentId;
    use async_trait::async_trait;
    use serde::Deserialize;

    /// `reqwest`-backed [`TokenIssuer`] against the directory's
    /// `POST /.gann/ws/token` endpoint (spec §6).
    pub struct ReqwestDirectoryClient {
        base_url: String,
        api_key: String,
        http: reqwest::Client,
    }

    #[derive(Deserialize)]
    struct TokenResponse {
        token: Option<String>,
        expires_at: Option<String>,
    }

    impl ReqwestDirectoryClient {
        /// Build a client against `base_url` (e.g. `https://directory.example`)
        /// authenticating with `api_key`.
        #[must_use]
        pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
            Self {
                base_url: base_url.into(),
                api_key: api_key.into(),
                http: reqwest::Client::new(),
            }
        }

        /// Derive the signaling socket URL for `token`, switching
        /// `https`→`wss` / `http`→`ws` and appending the token as a query
        /// parameter, per spec §6.
        #[must_use]
        pub fn signaling_url(&self, token: &Token) -> String {
            let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
                format!("wss://{rest}")
            } else if let Some(rest) = self.base_url.strip_prefix("http://") {
                format!("ws://{rest}")
            } else {
                self.base_url.clone()
            };
            let encoded = url::form_urlencoded::byte_serialize(token.value().as_bytes())
                .collect::<String>();
            format!("{}/.gann/ws?token={}", ws_base.trim_end_matches('/'), encoded)
        }
    }

    #[async_trait]
    impl TokenIssuer for ReqwestDirectoryClient {
        #[tracing::instrument(skip(self), fields(agent = %agent_id))]
        async fn issue_signaling_token(&self, agent_id: &AgentId) -> Result<Token, TokenError> {
            let url = format!("{}/.gann/ws/token", self.base_url.trim_end_matches('/'));
            let resp = self
                .http
                .post(&url)
                .header("GANN-API-KEY", &self.api_key)
                .header("GANN-AGENT-ID", agent_id.as_str())
                .send()
                .await
                .map_err(|e| TokenError(format!("token request failed: {e}")))?;

            if !resp.status().is_success() {
                return Err(TokenError(format!(
                    "directory returned HTTP {}",
                    resp.status()
                )));
            }

            let body: TokenResponse = resp
                .json()
                .await
                .map_err(|e| TokenError(format!("malformed token response: {e}")))?;

            let value = body
                .token
                .ok_or_else(|| TokenError("token response missing `token`".to_string()))?;
            let raw_expires_at = body
                .expires_at
                .ok_or_else(|| TokenError("token response missing `expires_at`".to_string()))?;

            Token::parse(value, raw_expires_at)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_token() {
        let token = Token::parse("tok-123", "2030-01-01T00:00:00Z").unwrap();
        assert_eq!(token.value(), "tok-123");
        assert_eq!(token.raw_expires_at(), "2030-01-01T00:00:00Z");
    }

    #[test]
    fn rejects_empty_value() {
        assert!(Token::parse("", "2030-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn rejects_invalid_timestamp() {
        assert!(Token::parse("tok-123", "not-a-timestamp").is_err());
    }
}
