use super::KitConfig;
use std::path::PathBuf;

impl KitConfig {
    /// Overlay `KITVAULT_*` environment variables, ignoring unparsable values.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Same as [`KitConfig::apply_env`] with an explicit variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KITVAULT_KEY_PATH") {
            self.storage.key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("KITVAULT_VAULT_PATH") {
            self.storage.vault_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("KITVAULT_KEY_MAX_AGE_DAYS") {
            if let Ok(n) = v.parse::<i64>() {
                self.storage.key_max_age_days = n;
            }
        }
        if let Some(v) = lookup("KITVAULT_CALLBACK_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.callback.port = n;
            }
        }
        if let Some(v) = lookup("KITVAULT_CALLBACK_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.callback.timeout_seconds = n;
            }
        }
        if let Some(v) = lookup("KITVAULT_AUTHORIZE_URL") {
            self.oauth.authorize_url = v;
        }
        if let Some(v) = lookup("KITVAULT_TOKEN_URL") {
            self.oauth.token_url = v;
        }
        if let Some(v) = lookup("KITVAULT_REDIRECT_URI") {
            self.oauth.redirect_uri = Some(v);
        }
        if let Some(v) = lookup("KITVAULT_CLIENT_KEY") {
            self.oauth.client_key = Some(v);
        }
        if let Some(v) = lookup("KITVAULT_CLIENT_SECRET") {
            self.oauth.client_secret = Some(v);
        }
        if let Some(v) = lookup("KITVAULT_REFRESH_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.refresh.max_attempts = n;
            }
        }
    }
}
