//! HTTP surface: channel administration, threads, messages, and files.

pub mod auth;
pub mod channels;
pub mod error;
pub mod threads;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::channels::{ChannelRegistry, FileProxy, OutboundDispatcher};

pub use auth::{CurrentUser, USER_ID_HEADER};
pub use error::ApiError;

/// Multipart framing allowance on top of the upload limit.
const BODY_OVERHEAD_BYTES: u64 = 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChannelRegistry>,
    pub dispatcher: Arc<OutboundDispatcher>,
    pub files: Arc<FileProxy>,
    /// Where uploads are staged before delivery.
    pub upload_dir: PathBuf,
}

/// Build the router with every route and the shared layers.
pub fn router(state: AppState) -> Router {
    let body_limit = state
        .dispatcher
        .max_upload_bytes()
        .saturating_add(BODY_OVERHEAD_BYTES);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route(
            "/groups/{group}/channels",
            get(channels::list_channels).post(channels::create_channel),
        )
        .route(
            "/groups/{group}/channels/{channel}",
            patch(channels::update_channel).delete(channels::delete_channel),
        )
        .route(
            "/groups/{group}/channels/{channel}/telegram/connect",
            post(channels::connect_telegram),
        )
        .route(
            "/groups/{group}/channels/{channel}/telegram/disconnect",
            post(channels::disconnect_telegram),
        )
        .route(
            "/groups/{group}/channels/{channel}/threads",
            get(channels::list_threads),
        )
        .route(
            "/threads/{thread}/messages",
            get(threads::list_messages).post(threads::send_message),
        )
        .route("/threads/{thread}/files/download", get(threads::download_file))
        .layer(DefaultBodyLimit::max(
            usize::try_from(body_limit).unwrap_or(usize::MAX),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "channel-bridge"
    }))
}
