//! OAuth2 authorization-code login.
//!
//! # Flow
//!
//! ```text
//! Idle
//!   → begin_login          random state, authorization URL
//! AwaitingUserAuthorization
//!   → await_callback       local listener receives ?code=..&state=..
//! AwaitingCallback
//!   → complete_login       state check, code exchange
//! ExchangingCode
//!   → Authenticated        session stored in the vault as current user
//! ```
//!
//! Any stage can end in `Failed`; the coordinator can start over with another
//! `begin_login`.

mod callback;
mod error;
mod exchange;
mod provider;
mod state;

pub use callback::{CallbackError, CallbackListener, ListenerHandle};
pub use error::AuthError;
pub use exchange::{TokenClient, TokenEndpointError, TokenGrant};
pub use provider::{ProviderConfig, CLIENT_KEY_CREDENTIAL, CLIENT_SECRET_CREDENTIAL};
pub use state::{AuthorizationRequest, CallbackResult};

use crate::config::CallbackConfig;
use crate::refresh::RetryPolicy;
use crate::vault::{Session, VaultStore, DEFAULT_TIER};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Stage of the current login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    AwaitingUserAuthorization,
    AwaitingCallback,
    ExchangingCode,
    Authenticated,
    Failed,
}

/// Listener settings for one interactive login
#[derive(Debug, Clone, Copy)]
pub struct LoginOptions {
    pub port: u16,
    pub timeout: Duration,
}

impl LoginOptions {
    pub fn from_config(config: &CallbackConfig) -> Self {
        Self {
            port: config.port,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

/// Drives login attempts against one provider.
pub struct OAuthCoordinator {
    provider: ProviderConfig,
    client: TokenClient,
    policy: RetryPolicy,
    tier: String,
    state: LoginState,
}

impl OAuthCoordinator {
    pub fn new(provider: ProviderConfig) -> Self {
        let client = TokenClient::new(&provider);
        Self::with_client(provider, client)
    }

    pub fn with_client(provider: ProviderConfig, client: TokenClient) -> Self {
        Self {
            provider,
            client,
            policy: RetryPolicy::default(),
            tier: DEFAULT_TIER.to_string(),
            state: LoginState::Idle,
        }
    }

    /// Tier label stamped on sessions created by this coordinator
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    /// Retry policy for transient code exchange failures
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    pub fn client(&self) -> &TokenClient {
        &self.client
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    /// Starts an attempt for `username` with a fresh state token.
    pub fn begin_login(&mut self, username: &str) -> AuthorizationRequest {
        let request = AuthorizationRequest::new(
            username,
            self.provider.redirect_uri.clone(),
            self.provider.scopes.clone(),
        );
        self.state = LoginState::AwaitingUserAuthorization;

        info!(username = %username, "Starting OAuth login");
        request
    }

    /// Authorization URL the user must open for `request`.
    pub fn authorization_url(&self, request: &AuthorizationRequest) -> String {
        self.provider.build_auth_url(request)
    }

    /// Waits for the redirect on `handle`.
    pub async fn await_callback<F>(
        &mut self,
        handle: &mut ListenerHandle,
        timeout: Duration,
        abort: F,
    ) -> Result<CallbackResult, AuthError>
    where
        F: Future<Output = ()>,
    {
        self.state = LoginState::AwaitingCallback;

        match handle.await_result_or_abort(timeout, abort).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.state = LoginState::Failed;
                warn!(error = %e, "No OAuth callback received");
                Err(match e {
                    CallbackError::TimedOut => AuthError::CallbackTimeout,
                    CallbackError::Aborted => AuthError::LoginAborted,
                    CallbackError::Closed => AuthError::Listener(e.to_string()),
                })
            }
        }
    }

    /// Verifies the callback, exchanges the code and stores the session.
    ///
    /// Transport errors and 5xx responses are retried per the retry policy.
    /// The vault is only written after a successful exchange.
    pub async fn complete_login(
        &mut self,
        vault: &VaultStore,
        request: &AuthorizationRequest,
        result: CallbackResult,
    ) -> Result<Session, AuthError> {
        if !request.matches_state(&result.state) {
            self.state = LoginState::Failed;
            warn!(username = %request.username, "OAuth callback state mismatch");
            return Err(AuthError::StateMismatch);
        }

        self.state = LoginState::ExchangingCode;

        let client = &self.client;
        let (code, redirect_uri) = (result.code.as_str(), request.redirect_uri.as_str());
        let outcome = self
            .policy
            .run(
                |_| client.exchange_code(code, redirect_uri),
                TokenEndpointError::is_transient,
            )
            .await;

        let grant = match outcome {
            Ok(grant) => grant,
            Err(e) => {
                self.state = LoginState::Failed;
                let attempts = e.attempts();
                let e = e.into_inner();
                error!(
                    username = %request.username,
                    attempts,
                    error = %e,
                    "Authorization code exchange failed"
                );
                return Err(AuthError::ExchangeFailed {
                    status: e.status(),
                    payload: e.payload(),
                });
            }
        };

        let session = Session::new(
            grant.access_token.clone(),
            grant.refresh_token.clone(),
            grant.expires_at(Utc::now()),
        )
        .with_tier(self.tier.clone());

        let stored = session.clone();
        if let Err(e) = vault.update(|doc| doc.login(&request.username, stored)) {
            self.state = LoginState::Failed;
            error!(username = %request.username, error = %e, "Failed to store session");
            return Err(AuthError::Storage(format!("{:#}", e)));
        }

        self.state = LoginState::Authenticated;
        info!(
            username = %request.username,
            has_refresh_token = session.refresh_token.is_some(),
            expires_at = ?session.expires_at,
            "OAuth login complete"
        );

        Ok(session)
    }

    /// Runs a whole login attempt.
    ///
    /// Starts the listener, hands the authorization URL to `on_url`, waits for
    /// the redirect (or `abort`), stops the listener and completes the login.
    pub async fn login<F, U>(
        &mut self,
        vault: &VaultStore,
        username: &str,
        options: &LoginOptions,
        abort: F,
        on_url: U,
    ) -> Result<Session, AuthError>
    where
        F: Future<Output = ()>,
        U: FnOnce(&str),
    {
        let mut handle = match CallbackListener::start(options.port).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state = LoginState::Failed;
                return Err(AuthError::Listener(format!("{:#}", e)));
            }
        };

        let request = self.begin_login(username);
        on_url(&self.authorization_url(&request));

        let outcome = self.await_callback(&mut handle, options.timeout, abort).await;
        handle.stop().await;

        let result = outcome?;
        self.complete_login(vault, &request, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::KeyManager;
    use mockito::Server;
    use tempfile::TempDir;

    fn provider(token_url: String) -> ProviderConfig {
        ProviderConfig {
            authorize_url: "https://example.com/oauth/authorize/".to_string(),
            token_url,
            scopes: vec!["user.info.basic".to_string()],
            redirect_uri: "http://localhost:8000/callback".to_string(),
            client_key: "ck".to_string(),
            client_secret: "cs".to_string(),
        }
    }

    fn vault(dir: &TempDir) -> VaultStore {
        let key = KeyManager::new(dir.path().join("key")).ensure_key().unwrap();
        VaultStore::new(dir.path().join("vault"), key)
    }

    fn callback(code: &str, state: &str) -> CallbackResult {
        CallbackResult {
            code: code.to_string(),
            state: state.to_string(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_begin_login() {
        let mut coordinator = OAuthCoordinator::new(provider("http://unused".to_string()));
        assert_eq!(coordinator.state(), LoginState::Idle);

        let request = coordinator.begin_login("alice");
        let url = coordinator.authorization_url(&request);

        assert_eq!(coordinator.state(), LoginState::AwaitingUserAuthorization);
        assert_eq!(request.username, "alice");
        assert!(url.contains(&format!("state={}", request.state)));
        assert!(url.contains("client_key=ck"));
    }

    #[tokio::test]
    async fn test_complete_login_stores_session() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "grant_type": "authorization_code",
                "code": "ABC123",
                "redirect_uri": "http://localhost:8000/callback"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"T","refresh_token":"R","expires_in":7200}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator =
            OAuthCoordinator::new(provider(format!("{}/token/", server.url()))).with_tier("basic");

        let request = coordinator.begin_login("alice");
        let state = request.state.clone();
        let session = coordinator
            .complete_login(&store, &request, callback("ABC123", &state))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(coordinator.state(), LoginState::Authenticated);
        assert_eq!(session.access_token, "T");
        assert_eq!(session.refresh_token.as_deref(), Some("R"));
        assert_eq!(session.tier, "basic");

        let expires_in = session.expires_at.unwrap() - Utc::now();
        assert!(expires_in > chrono::Duration::seconds(7100));
        assert!(expires_in <= chrono::Duration::seconds(7200));

        let doc = store.load();
        assert_eq!(doc.current_user(), Some("alice"));
        assert_eq!(doc.session("alice"), Some(&session));
    }

    #[tokio::test]
    async fn test_state_mismatch_leaves_vault_untouched() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token/")
            .with_status(200)
            .with_body(r#"{"access_token":"T"}"#)
            .expect(0)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator = OAuthCoordinator::new(provider(format!("{}/token/", server.url())));

        let request = coordinator.begin_login("bob");
        let err = coordinator
            .complete_login(&store, &request, callback("ABC123", "bob"))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert_eq!(err, AuthError::StateMismatch);
        assert_eq!(coordinator.state(), LoginState::Failed);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_exchange_failure_reports_payload() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token/")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator = OAuthCoordinator::new(provider(format!("{}/token/", server.url())));

        let request = coordinator.begin_login("alice");
        let state = request.state.clone();
        let err = coordinator
            .complete_login(&store, &request, callback("BAD", &state))
            .await
            .unwrap_err();

        match err {
            AuthError::ExchangeFailed { status, payload } => {
                assert_eq!(status, Some(400));
                assert!(payload.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(coordinator.state(), LoginState::Failed);
        assert!(store.load().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_retries_transient_failures() {
        let mut server = Server::new_async().await;
        let unavailable = server
            .mock("POST", "/token/")
            .with_status(503)
            .with_body("down")
            .expect(2)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/token/")
            .with_status(200)
            .with_body(r#"{"access_token":"T","expires_in":7200}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator = OAuthCoordinator::new(provider(format!("{}/token/", server.url())))
            .with_retry_policy(RetryPolicy::immediate(3));

        let request = coordinator.begin_login("alice");
        let state = request.state.clone();
        let session = coordinator
            .complete_login(&store, &request, callback("ABC123", &state))
            .await
            .unwrap();

        unavailable.assert_async().await;
        ok.assert_async().await;
        assert_eq!(session.access_token, "T");
        assert_eq!(coordinator.state(), LoginState::Authenticated);
        assert_eq!(store.load().current_user(), Some("alice"));
    }

    #[tokio::test]
    async fn test_exchange_gives_up_after_configured_attempts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token/")
            .with_status(503)
            .with_body("down")
            .expect(4)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator = OAuthCoordinator::new(provider(format!("{}/token/", server.url())))
            .with_retry_policy(RetryPolicy::immediate(4));

        let request = coordinator.begin_login("alice");
        let state = request.state.clone();
        let err = coordinator
            .complete_login(&store, &request, callback("ABC123", &state))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert_eq!(
            err,
            AuthError::ExchangeFailed {
                status: Some(503),
                payload: "down".to_string()
            }
        );
        assert_eq!(coordinator.state(), LoginState::Failed);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_out_of_range_expires_in_does_not_panic() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token/")
            .with_status(200)
            .with_body(r#"{"access_token":"T","expires_in":9223372036854775807}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator = OAuthCoordinator::new(provider(format!("{}/token/", server.url())))
            .with_retry_policy(RetryPolicy::immediate(3));

        let request = coordinator.begin_login("alice");
        let state = request.state.clone();
        let err = coordinator
            .complete_login(&store, &request, callback("ABC123", &state))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, AuthError::ExchangeFailed { status: Some(200), .. }));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_missing_expires_in_leaves_expiry_unset() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token/")
            .with_status(200)
            .with_body(r#"{"access_token":"T"}"#)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator = OAuthCoordinator::new(provider(format!("{}/token/", server.url())));

        let request = coordinator.begin_login("alice");
        let state = request.state.clone();
        let session = coordinator
            .complete_login(&store, &request, callback("C", &state))
            .await
            .unwrap();

        assert_eq!(session.expires_at, None);
        assert_eq!(session.refresh_token, None);
    }

    #[tokio::test]
    async fn test_await_callback_timeout_and_abort() {
        let mut coordinator = OAuthCoordinator::new(provider("http://unused".to_string()));
        let mut handle = CallbackListener::start(0).await.unwrap();

        coordinator.begin_login("alice");
        let err = coordinator
            .await_callback(&mut handle, Duration::from_millis(50), std::future::pending())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::CallbackTimeout);
        assert_eq!(coordinator.state(), LoginState::Failed);

        let err = coordinator
            .await_callback(&mut handle, Duration::from_secs(30), async {})
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::LoginAborted);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_login_fails_when_port_taken() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let dir = TempDir::new().unwrap();
        let store = vault(&dir);
        let mut coordinator = OAuthCoordinator::new(provider("http://unused".to_string()));
        let options = LoginOptions {
            port,
            timeout: Duration::from_secs(1),
        };

        let err = coordinator
            .login(&store, "alice", &options, std::future::pending(), |_| {
                panic!("URL must not be offered without a listener")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Listener(_)));
        assert_eq!(coordinator.state(), LoginState::Failed);
    }
}
