//! OAuth provider configuration.
//!
//! Endpoint URLs and scopes come from [`OAuthSettings`]; the client key and
//! secret come from configuration/environment first and the vault second.

use super::AuthorizationRequest;
use crate::config::OAuthSettings;
use crate::vault::VaultDocument;
use anyhow::{anyhow, Result};

/// Vault credential holding the OAuth client key
pub const CLIENT_KEY_CREDENTIAL: &str = "client_key";

/// Vault credential holding the OAuth client secret
pub const CLIENT_SECRET_CREDENTIAL: &str = "client_secret";

/// OAuth provider configuration
#[derive(Clone)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub authorize_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Requested OAuth scopes
    pub scopes: Vec<String>,

    /// Redirect URI registered with the provider
    pub redirect_uri: String,

    /// Client key
    pub client_key: String,

    /// Client secret
    pub client_secret: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("redirect_uri", &self.redirect_uri)
            .field("client_key", &self.client_key)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ProviderConfig {
    /// Builds the provider config, resolving client credentials.
    ///
    /// Settings win over vault credentials. Empty values are rejected.
    pub fn resolve(
        settings: &OAuthSettings,
        redirect_uri: String,
        doc: &VaultDocument,
    ) -> Result<Self> {
        let client_key = settings
            .client_key
            .clone()
            .or_else(|| doc.credential(CLIENT_KEY_CREDENTIAL).map(String::from))
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "OAuth client key not configured. Set KITVAULT_CLIENT_KEY or store the '{}' credential.",
                    CLIENT_KEY_CREDENTIAL
                )
            })?;

        let client_secret = settings
            .client_secret
            .clone()
            .or_else(|| doc.credential(CLIENT_SECRET_CREDENTIAL).map(String::from))
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "OAuth client secret not configured. Set KITVAULT_CLIENT_SECRET or store the '{}' credential.",
                    CLIENT_SECRET_CREDENTIAL
                )
            })?;

        Ok(Self {
            authorize_url: settings.authorize_url.clone(),
            token_url: settings.token_url.clone(),
            scopes: settings.scopes.clone(),
            redirect_uri,
            client_key,
            client_secret,
        })
    }

    /// Build authorization URL for a pending request
    pub fn build_auth_url(&self, request: &AuthorizationRequest) -> String {
        let scopes = request.scopes.join(",");
        let separator = if self.authorize_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}client_key={}&scope={}&response_type=code&redirect_uri={}&state={}",
            self.authorize_url,
            separator,
            urlencoding::encode(&self.client_key),
            urlencoding::encode(&scopes),
            urlencoding::encode(&request.redirect_uri),
            urlencoding::encode(&request.state)
        )
    }
}
