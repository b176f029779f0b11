use std::fmt;

/// Failures of the login and refresh flows.
///
/// None of these are fatal to the process: the caller reports the message and
/// offers the user another login attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Callback `state` does not belong to the pending authorization request
    StateMismatch,
    /// Authorization code exchange failed; `payload` is the provider's response body
    ExchangeFailed {
        status: Option<u16>,
        payload: String,
    },
    /// Token expired and the session has no refresh token
    NoRefreshToken,
    /// Provider refused the refresh token (4xx or no access token in the response)
    RefreshRejected { status: u16, payload: String },
    /// Refresh kept failing transiently until the retry budget ran out
    RefreshFailed { attempts: u32, reason: String },
    /// No callback arrived before the deadline
    CallbackTimeout,
    /// User cancelled the login while waiting for the callback
    LoginAborted,
    /// Callback listener could not be started or died
    Listener(String),
    /// Vault could not persist the session
    Storage(String),
}

impl AuthError {
    /// True when the only way forward is a fresh interactive login.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::NoRefreshToken | AuthError::RefreshRejected { .. }
        )
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::StateMismatch => write!(
                f,
                "OAuth state mismatch: the callback does not belong to this login attempt"
            ),
            AuthError::ExchangeFailed {
                status: Some(status),
                payload,
            } => write!(
                f,
                "Token exchange failed with status {}: {}",
                status, payload
            ),
            AuthError::ExchangeFailed {
                status: None,
                payload,
            } => write!(f, "Token exchange failed: {}", payload),
            AuthError::NoRefreshToken => {
                write!(f, "Access token expired and no refresh token is available")
            }
            AuthError::RefreshRejected { status, payload } => write!(
                f,
                "Token refresh rejected with status {}: {}",
                status, payload
            ),
            AuthError::RefreshFailed { attempts, reason } => write!(
                f,
                "Token refresh failed after {} attempts: {}",
                attempts, reason
            ),
            AuthError::CallbackTimeout => {
                write!(f, "Timed out waiting for the OAuth callback")
            }
            AuthError::LoginAborted => write!(f, "Login aborted"),
            AuthError::Listener(msg) => write!(f, "Callback listener error: {}", msg),
            AuthError::Storage(msg) => write!(f, "Failed to store session: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}
