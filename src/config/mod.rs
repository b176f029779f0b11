mod env;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Complete kitvault configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KitConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

impl KitConfig {
    /// Redirect URI registered with the provider.
    ///
    /// Falls back to the local callback listener address when not configured.
    pub fn redirect_uri(&self) -> String {
        self.oauth
            .redirect_uri
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}/callback", self.callback.port))
    }
}

/// Key and vault file locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_vault_path")]
    pub vault_path: PathBuf,
    /// Rotate the encryption key once it is older than this
    #[serde(default = "default_key_max_age_days")]
    pub key_max_age_days: i64,
}

fn home_file(name: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}

fn default_key_path() -> PathBuf {
    home_file(".kitvault.key")
}

fn default_vault_path() -> PathBuf {
    home_file(".kitvault.vault")
}

fn default_key_max_age_days() -> i64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            vault_path: default_vault_path(),
            key_max_age_days: default_key_max_age_days(),
        }
    }
}

/// Local OAuth callback listener
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_port")]
    pub port: u16,
    /// How long a login attempt waits for the browser redirect (seconds)
    #[serde(default = "default_callback_timeout")]
    pub timeout_seconds: u64,
}

fn default_callback_port() -> u16 {
    8000
}

fn default_callback_timeout() -> u64 {
    300
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            port: default_callback_port(),
            timeout_seconds: default_callback_timeout(),
        }
    }
}

/// OAuth provider endpoints and client registration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthSettings {
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Overrides the `http://localhost:<port>/callback` default
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Tier label stamped on new sessions
    #[serde(default = "default_tier")]
    pub tier: String,
    /// Client key; when unset the vault credential `client_key` is used
    #[serde(default)]
    pub client_key: Option<String>,
    /// Client secret; when unset the vault credential `client_secret` is used
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_authorize_url() -> String {
    "https://open.tiktokapis.com/v2/oauth/authorize/".to_string()
}

fn default_token_url() -> String {
    "https://open.tiktokapis.com/v2/oauth/token/".to_string()
}

fn default_scopes() -> Vec<String> {
    [
        "user.info.basic",
        "video.list",
        "ads.manage",
        "research.data.basic",
        "affiliate.seller",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_tier() -> String {
    crate::vault::DEFAULT_TIER.to_string()
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            scopes: default_scopes(),
            redirect_uri: None,
            tier: default_tier(),
            client_key: None,
            client_secret: None,
        }
    }
}

/// Token refresh and retry behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Refresh tokens that expire within this many seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_window_seconds() -> i64 {
    90
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    4_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<KitConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: KitConfig = toml::from_str(&contents)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}

/// Default config file location (`~/.kitvault.toml`)
pub fn default_config_path() -> PathBuf {
    home_file(".kitvault.toml")
}
