//! One-shot local HTTP listener for the OAuth redirect.
//!
//! Serves `GET /callback?code=..&state=..` on a loopback port for the duration
//! of a single login attempt. The first well-formed request is handed to the
//! waiting coordinator through a oneshot channel; malformed requests get a 400
//! and the listener keeps waiting.

use super::CallbackResult;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for open connections before aborting the server task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const SUCCESS_PAGE: &str = "<html><body><h2>Authorization successful!</h2>\
<p>You can close this window and return to the terminal.</p></body></html>";

const FAILURE_PAGE: &str = "<html><body><h2>Authorization failed.</h2>\
<p>The redirect did not carry an authorization code. Please retry the login.</p></body></html>";

const ALREADY_CAPTURED_PAGE: &str = "<html><body><h2>Authorization already received.</h2>\
<p>You can close this window.</p></body></html>";

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

type ResultSlot = Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>;

/// Why a wait for the callback ended without a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    TimedOut,
    Aborted,
    /// Listener stopped or the result was already taken
    Closed,
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackError::TimedOut => write!(f, "Timed out waiting for OAuth callback"),
            CallbackError::Aborted => write!(f, "Wait for OAuth callback aborted"),
            CallbackError::Closed => write!(f, "OAuth callback listener is closed"),
        }
    }
}

impl std::error::Error for CallbackError {}

/// Entry point for starting callback listeners
pub struct CallbackListener;

impl CallbackListener {
    /// Binds `127.0.0.1:port` and starts serving in the background.
    ///
    /// Port 0 picks a free port; see [`ListenerHandle::local_addr`].
    pub async fn start(port: u16) -> Result<ListenerHandle> {
        Self::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
    }

    pub async fn bind(addr: SocketAddr) -> Result<ListenerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind OAuth callback listener on {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read callback listener address")?;

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let router = callback_router(Arc::new(Mutex::new(Some(result_tx))));

        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "OAuth callback listener error");
            }
            debug!("OAuth callback listener stopped");
        });

        info!(addr = %local_addr, "OAuth callback listener started");

        Ok(ListenerHandle {
            local_addr,
            result_rx: Some(result_rx),
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A running callback listener.
///
/// Dropping the handle stops the server, so a listener never outlives the
/// login attempt that owns it.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    result_rx: Option<oneshot::Receiver<CallbackResult>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the first well-formed callback or until `timeout` elapses.
    pub async fn await_result(&mut self, timeout: Duration) -> Result<CallbackResult, CallbackError> {
        self.await_result_or_abort(timeout, std::future::pending::<()>())
            .await
    }

    /// Like [`ListenerHandle::await_result`], also ending when `abort` completes.
    pub async fn await_result_or_abort<F>(
        &mut self,
        timeout: Duration,
        abort: F,
    ) -> Result<CallbackResult, CallbackError>
    where
        F: Future<Output = ()>,
    {
        let rx = self.result_rx.as_mut().ok_or(CallbackError::Closed)?;

        let outcome = tokio::select! {
            received = tokio::time::timeout(timeout, rx) => match received {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) => Err(CallbackError::Closed),
                Err(_) => Err(CallbackError::TimedOut),
            },
            _ = abort => Err(CallbackError::Aborted),
        };

        // A completed receiver must not be polled again
        if matches!(outcome, Ok(_) | Err(CallbackError::Closed)) {
            self.result_rx = None;
        }

        outcome
    }

    /// Stops accepting connections and waits briefly for the server task.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("OAuth callback listener did not shut down in time, aborting");
                task.abort();
            }
        }
        debug!(addr = %self.local_addr, "OAuth callback listener released");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn callback_router(slot: ResultSlot) -> Router {
    Router::new()
        .route("/callback", get(handle_callback))
        .with_state(slot)
}

/// GET /callback
async fn handle_callback(
    State(slot): State<ResultSlot>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        let description = query
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(
            error = %error,
            description = %description,
            "OAuth authorization failed at provider"
        );
        return (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE)).into_response();
    }

    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    let (code, state) = match (non_empty(query.code), non_empty(query.state)) {
        (Some(code), Some(state)) => (code, state),
        _ => {
            warn!("OAuth callback missing 'code' or 'state', still waiting");
            return (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE)).into_response();
        }
    };

    let sender = slot.lock().unwrap_or_else(|p| p.into_inner()).take();
    let Some(sender) = sender else {
        debug!("OAuth callback received after capture, ignoring");
        return (StatusCode::CONFLICT, Html(ALREADY_CAPTURED_PAGE)).into_response();
    };

    let result = CallbackResult {
        code,
        state,
        received_at: Utc::now(),
    };
    if sender.send(result).is_err() {
        warn!("OAuth callback arrived after the login attempt ended");
        return (StatusCode::GONE, Html(FAILURE_PAGE)).into_response();
    }

    info!("OAuth callback captured");
    (StatusCode::OK, Html(SUCCESS_PAGE)).into_response()
}
