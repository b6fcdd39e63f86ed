use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use serde::Deserialize;

use super::state::AppState;
use crate::auth::{logout_cookie, Principal};
use crate::files::BrowserError;
use crate::session::SessionError;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

// ── Health ──────────────────────────────────────────────────────────────

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.count(),
    }))
}

// ── Auth ────────────────────────────────────────────────────────────────

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/status", get(auth_status))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    token: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    if !state.auth.is_required() {
        return Ok(Json(serde_json::json!({ "authenticated": true })).into_response());
    }

    if state.auth.verify_token(&req.token).is_none() {
        tracing::warn!("Rejected login attempt");
        return Err(api_error(StatusCode::UNAUTHORIZED, "invalid token"));
    }

    let cookie = state
        .auth
        .login_cookie()
        .ok_or_else(|| api_error(StatusCode::INTERNAL_SERVER_ERROR, "auth not configured"))?;

    Ok((
        [(SET_COOKIE, cookie)],
        Json(serde_json::json!({ "authenticated": true })),
    )
        .into_response())
}

async fn logout() -> impl IntoResponse {
    (
        [(SET_COOKIE, logout_cookie())],
        Json(serde_json::json!({ "authenticated": false })),
    )
}

async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    Json(serde_json::json!({
        "auth_required": state.auth.is_required(),
        "authenticated": state.auth.resolve(&headers, None).is_some(),
    }))
}

// ── Sessions ────────────────────────────────────────────────────────────

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", delete(terminate_session))
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> impl IntoResponse {
    Json(state.registry.list_for_owner(&principal))
}

async fn terminate_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .terminate(&id, &principal)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| {
            let status = match e {
                SessionError::NotFound(_) | SessionError::AlreadyTerminated(_) => {
                    StatusCode::NOT_FOUND
                }
                SessionError::NotAuthorized(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            api_error(status, e.to_string())
        })
}

// ── Files ───────────────────────────────────────────────────────────────

pub fn file_routes() -> Router<AppState> {
    Router::new()
        .route("/api/files", get(list_files))
        .route("/api/files/content", get(file_content))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    path: Option<PathBuf>,
    #[serde(default)]
    hidden: bool,
}

#[derive(Debug, Deserialize)]
struct ContentQuery {
    path: Option<PathBuf>,
}

fn browser_error(e: BrowserError) -> ApiError {
    let status = match e {
        BrowserError::PathOutsideBoundary(_) | BrowserError::PermissionDenied(_) => {
            StatusCode::FORBIDDEN
        }
        BrowserError::PathNotFound(_) => StatusCode::NOT_FOUND,
        BrowserError::NotADirectory(_) | BrowserError::NotAFile(_) => StatusCode::BAD_REQUEST,
        BrowserError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        BrowserError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let path = match query.path {
        Some(path) => path,
        None => state
            .browser
            .default_path()
            .map(PathBuf::from)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no browsable roots configured"))?,
    };

    let browser = state.browser.clone();
    let listing = tokio::task::spawn_blocking(move || browser.list_directory(&path, query.hidden))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(browser_error)?;

    Ok(Json(listing))
}

async fn file_content(
    State(state): State<AppState>,
    Query(query): Query<ContentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let path = query
        .path
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing path parameter"))?;
    let max_size = state.config.files.max_size;

    let browser = state.browser.clone();
    let content = tokio::task::spawn_blocking(move || browser.read_file(&path, max_size))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(browser_error)?;

    Ok(Json(content))
}
