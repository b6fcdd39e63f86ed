//! HTTP and websocket surface of the daemon.

pub mod routes;
pub mod state;
pub mod ws;

use anyhow::Context;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;

pub use state::AppState;

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Resolves the caller to a [`Principal`](crate::auth::Principal) and stores
/// it as a request extension. Browsers cannot set headers on a websocket
/// upgrade, so the token is also accepted as a `?token=` query parameter.
async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let query_token = Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.token);

    match state.auth.resolve(req.headers(), query_token.as_deref()) {
        Some(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid or missing token" })),
        )
            .into_response(),
    }
}

/// Build the axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(routes::session_routes())
        .merge(routes::file_routes())
        .route("/ws", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let public = Router::new()
        .merge(routes::health_routes())
        .merge(routes::auth_routes());

    let mut app = Router::new().merge(protected).merge(public);

    if let Some(dir) = &state.config.server.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.with_state(state).layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve until `shutdown` fires.
pub async fn serve(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    run(listener, AppState::new(config), shutdown).await
}

/// Serve on an already bound listener.
///
/// On shutdown every session is terminated before the server stops, so
/// open websockets receive their close frame and no shell outlives the
/// daemon.
pub async fn run(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Listening on {}", addr);

    if !state.auth.is_required() {
        tracing::warn!("No token configured, anyone who can reach {} gets a shell", addr);
    }

    let registry = state.registry.clone();
    let reaper = registry.start_reaper(
        state.config.session.reap_interval(),
        shutdown.child_token(),
    );

    let router = build_router(state);
    let drain = registry.clone();
    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.cancelled().await;
            tracing::info!("Shutting down, terminating {} sessions", drain.count());
            drain.shutdown().await;
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = reaper.await;
    registry.shutdown().await;

    tracing::info!("Server stopped");
    Ok(())
}
