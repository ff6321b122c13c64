//! HTTP server: JSON API, job event streams and on-demand sources.

pub mod api;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use api::{ApiError, AppState, SharedState};

use crate::assets::Resolved;
use crate::config::ServerConfig;
use crate::services::Services;

/// Build the full application router with the API and the source fallback.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .fallback(static_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve `*.js` requests from the asset cache.
async fn static_handler(
    State(state): State<SharedState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = uri.path();
    if !path.ends_with(".js") {
        return Err(ApiError::NotFound(format!("Not found: {}", path)));
    }
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    match state.assets.resolve(path, if_none_match).await? {
        Resolved::NotModified { etag } => {
            Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, header_value(&etag)?)]).into_response())
        }
        Resolved::Fresh(asset) => {
            let mut response_headers = HeaderMap::new();
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/javascript; charset=utf-8"),
            );
            response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response_headers.insert(header::ETAG, header_value(&asset.etag)?);
            if let Some(modified) = asset.last_modified {
                let formatted = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
                response_headers.insert(header::LAST_MODIFIED, header_value(&formatted)?);
            }
            Ok((response_headers, asset.content.to_string()).into_response())
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|e| ApiError::Internal(format!("Invalid header value: {}", e)))
}

/// Periodic synchronization and staleness polling. A zero interval disables
/// the corresponding loop.
pub fn spawn_background_tasks(state: &SharedState, sync_every: Duration, stale_every: Duration) {
    if !sync_every.is_zero() {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_every);
            loop {
                ticker.tick().await;
                if let Err(e) = state.synchronizer.sync().await {
                    warn!(error = %format!("{:#}", e), "scheduled synchronization failed");
                }
            }
        });
    }
    if !stale_every.is_zero() {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stale_every);
            loop {
                ticker.tick().await;
                let stale = state.refresh_stale().await;
                info!(stale, "staleness poll complete");
            }
        });
    }
}

/// Start the server and block until Ctrl-C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let services = Services::from_config(&config)?;
    let state = AppState::new(services, config.heartbeat());
    spawn_background_tasks(
        &state,
        Duration::from_secs(config.sync_interval_secs),
        Duration::from_secs(config.stale_interval_secs),
    );

    let mut app = build_router(Arc::clone(&state));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "buildyard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.store.persist_or_log().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
