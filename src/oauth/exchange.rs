//! OAuth token endpoint calls.
//!
//! Handles exchanging authorization codes and refresh tokens for access tokens.
//! Requests are JSON bodies carrying `client_key` and `client_secret`.

use super::ProviderConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Timeout for a single token endpoint request
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Longest token lifetime accepted from the provider (100 years)
const MAX_EXPIRES_IN_SECS: i64 = 100 * 365 * 24 * 3600;

/// OAuth token request body
#[derive(Serialize)]
struct TokenRequest<'a> {
    client_key: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_uri: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Tokens issued by the provider
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Declared lifetime in seconds
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Absolute expiry for a grant received at `now`.
    ///
    /// `None` when no lifetime was declared or it does not fit the calendar.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Token endpoint failures
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEndpointError {
    /// Request never produced a response (connect, timeout, body read)
    Transport(String),
    /// Non-2xx response
    Status { status: u16, body: String },
    /// 2xx response without an access token (providers that report errors in-band)
    MissingAccessToken { body: String },
    /// 2xx response that is not a token document
    InvalidResponse { reason: String, body: String },
}

impl TokenEndpointError {
    /// Transport failures and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            TokenEndpointError::Transport(_) => true,
            TokenEndpointError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            TokenEndpointError::Status { status, .. } => Some(*status),
            TokenEndpointError::MissingAccessToken { .. }
            | TokenEndpointError::InvalidResponse { .. } => Some(200),
            TokenEndpointError::Transport(_) => None,
        }
    }

    /// Provider payload (or transport message) for diagnostics.
    pub fn payload(&self) -> String {
        match self {
            TokenEndpointError::Transport(msg) => msg.clone(),
            TokenEndpointError::Status { body, .. }
            | TokenEndpointError::MissingAccessToken { body } => body.clone(),
            TokenEndpointError::InvalidResponse { reason, body } => {
                format!("{} ({})", reason, body)
            }
        }
    }
}

impl fmt::Display for TokenEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenEndpointError::Transport(msg) => {
                write!(f, "Failed to reach token endpoint: {}", msg)
            }
            TokenEndpointError::Status { status, body } => {
                write!(f, "Token endpoint returned status {}: {}", status, body)
            }
            TokenEndpointError::MissingAccessToken { body } => {
                write!(f, "Token response has no access token: {}", body)
            }
            TokenEndpointError::InvalidResponse { reason, body } => {
                write!(f, "Failed to parse token response: {} ({})", reason, body)
            }
        }
    }
}

impl std::error::Error for TokenEndpointError {}

/// Client for the provider's token endpoint
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    token_url: String,
    client_key: String,
    client_secret: String,
}

impl TokenClient {
    pub fn new(provider: &ProviderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_http_client(provider, http)
    }

    pub fn with_http_client(provider: &ProviderConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            token_url: provider.token_url.clone(),
            client_key: provider.client_key.clone(),
            client_secret: provider.client_secret.clone(),
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// Exchange authorization code for tokens
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenEndpointError> {
        self.request(TokenRequest {
            client_key: &self.client_key,
            client_secret: &self.client_secret,
            grant_type: "authorization_code",
            code: Some(code),
            redirect_uri: Some(redirect_uri),
            refresh_token: None,
        })
        .await
    }

    /// Exchange refresh token for a new access token
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenEndpointError> {
        self.request(TokenRequest {
            client_key: &self.client_key,
            client_secret: &self.client_secret,
            grant_type: "refresh_token",
            code: None,
            redirect_uri: None,
            refresh_token: Some(refresh_token),
        })
        .await
    }

    async fn request(&self, body: TokenRequest<'_>) -> Result<TokenGrant, TokenEndpointError> {
        debug!(
            token_url = %self.token_url,
            grant_type = body.grant_type,
            "Calling token endpoint"
        );

        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| TokenEndpointError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TokenEndpointError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(TokenEndpointError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let token_response: TokenResponse =
            serde_json::from_str(&text).map_err(|e| TokenEndpointError::InvalidResponse {
                reason: e.to_string(),
                body: text.clone(),
            })?;

        let access_token = match token_response.access_token {
            Some(token) if !token.is_empty() => token,
            _ => return Err(TokenEndpointError::MissingAccessToken { body: text }),
        };

        if let Some(seconds) = token_response.expires_in {
            if !(0..=MAX_EXPIRES_IN_SECS).contains(&seconds) {
                return Err(TokenEndpointError::InvalidResponse {
                    reason: format!("expires_in {} out of range", seconds),
                    body: text,
                });
            }
        }

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            token_type = ?token_response.token_type,
            "Token endpoint call successful"
        );

        Ok(TokenGrant {
            access_token,
            refresh_token: token_response.refresh_token,
            expires_in: token_response.expires_in,
        })
    }
}
