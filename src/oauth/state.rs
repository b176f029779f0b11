//! Per-attempt OAuth correlation values.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A pending authorization attempt (never persisted)
#[derive(Clone, Debug)]
pub struct AuthorizationRequest {
    /// Random anti-CSRF value echoed back by the provider
    pub state: String,
    /// User the resulting session will be stored under
    pub username: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    /// Creates a request with a fresh random state token (UUID v4)
    pub fn new(username: &str, redirect_uri: String, scopes: Vec<String>) -> Self {
        Self {
            state: Uuid::new_v4().simple().to_string(),
            username: username.to_string(),
            redirect_uri,
            scopes,
            created_at: Utc::now(),
        }
    }

    /// True if `state` is the value issued for this request
    pub fn matches_state(&self, state: &str) -> bool {
        // Constant time for equal-length inputs
        self.state.len() == state.len()
            && self
                .state
                .bytes()
                .zip(state.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

/// Values captured from the provider redirect
#[derive(Clone, Debug, PartialEq)]
pub struct CallbackResult {
    pub code: String,
    pub state: String,
    pub received_at: DateTime<Utc>,
}
