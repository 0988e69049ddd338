//! Request handlers and error-to-status mapping.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::models::session::validate_user_id;
use crate::orchestrator::session_manager::{SessionManager, SessionSummary};
use crate::AppError;

/// Login form body.
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    /// Alphanumeric user identifier.
    pub username: String,
}

/// HTTP wrapper that maps [`AppError`] onto a status code and JSON body.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status code returned for the wrapped error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.0 {
            AppError::InvalidUser(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AllocationExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Spawn(_) => StatusCode::BAD_GATEWAY,
            AppError::Provisioning(_)
            | AppError::PortConflict(_)
            | AppError::Config(_)
            | AppError::Db(_)
            | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(err = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}

/// `POST /login`: ensure the user's session and redirect to it.
///
/// # Errors
///
/// Returns the mapped [`ApiError`] for any supervisor failure.
pub async fn login(
    State(sessions): State<Arc<SessionManager>>,
    Form(form): Form<LoginForm>,
) -> Result<Redirect, ApiError> {
    validate_user_id(&form.username)?;
    let endpoint = sessions.ensure_session_detached(form.username).await?;
    let url = endpoint.url();
    info!(%url, "redirecting to session");
    Ok(Redirect::to(&url))
}

/// `GET /admin/sessions`
///
/// # Errors
///
/// Returns the mapped [`ApiError`] if the registry cannot be read.
pub async fn list_sessions(
    State(sessions): State<Arc<SessionManager>>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(sessions.list_sessions().await?))
}

/// `DELETE /admin/users/{user_id}`
///
/// # Errors
///
/// Returns the mapped [`ApiError`]; `404` when the user is unknown.
pub async fn delete_user(
    State(sessions): State<Arc<SessionManager>>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    sessions.delete_session(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
