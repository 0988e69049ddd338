//! Minimal HTTP front end over the session supervisor.
//!
//! Routes:
//!
//! - `GET /health` liveness of the supervisor itself
//! - `POST /login` form field `username`; redirects to the user's server
//! - `GET /admin/sessions` JSON list of records with liveness
//! - `DELETE /admin/users/{user_id}` administrative delete

pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::session_manager::SessionManager;
use crate::{AppError, Result};

/// Build the router with the supervisor as shared state.
pub fn router(sessions: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/login", post(handlers::login))
        .route("/admin/sessions", get(handlers::list_sessions))
        .route("/admin/users/{user_id}", delete(handlers::delete_user))
        .with_state(sessions)
}

/// Serve the router on `bind` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the listener cannot bind or the server fails.
pub async fn serve(
    sessions: Arc<SessionManager>,
    bind: SocketAddr,
    ct: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Io(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "starting HTTP front end");

    axum::serve(listener, router(sessions))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("HTTP front end shut down");
    Ok(())
}

/// Serve until `shutdown` resolves or the server itself stops.
///
/// A server that stops on its own (for example, the port is already in
/// use) ends the call with its error instead of waiting for `shutdown`.
///
/// # Errors
///
/// Returns the serve error, or `AppError::Io` if the server task panicked.
pub async fn run_until(
    sessions: Arc<SessionManager>,
    bind: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let ct = CancellationToken::new();
    let mut handle = tokio::spawn(serve(sessions, bind, ct.clone()));

    tokio::select! {
        joined = &mut handle => {
            let result = joined
                .map_err(|err| AppError::Io(format!("http task failed: {err}")))
                .and_then(|served| served);
            match result {
                Ok(()) => Err(AppError::Io("HTTP front end stopped unexpectedly".into())),
                Err(err) => {
                    error!(%err, "http front end failed");
                    Err(err)
                }
            }
        }
        () = shutdown => {
            info!("shutdown signal received");
            ct.cancel();
            handle
                .await
                .map_err(|err| AppError::Io(format!("http task failed: {err}")))?
        }
    }
}
