//! Channel administration routes under `/groups/{group}/channels`.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use super::auth::CurrentUser;
use super::error::ApiError;
use crate::channels::model::{
    Channel, ChannelSettings, ChannelStatus, PageRequest, Provider,
};
use crate::channels::registry::{ChannelUpdate, THREADS_DEFAULT_PER_PAGE, THREADS_MAX_PER_PAGE};

/// Public shape of a channel. Secrets are reduced to a flag.
#[derive(Debug, Serialize)]
pub struct ChannelView {
    pub id: Uuid,
    pub group_id: i64,
    pub provider: Provider,
    pub display_name: String,
    pub status: ChannelStatus,
    pub settings: ChannelSettings,
    pub has_token: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Channel> for ChannelView {
    fn from(c: Channel) -> Self {
        let has_token = c.has_token();
        Self {
            id: c.id,
            group_id: c.group_id,
            provider: c.provider,
            display_name: c.display_name,
            status: c.status,
            settings: c.settings,
            has_token,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub provider: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChannelRequest {
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub settings: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub bot_token: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct ThreadsQuery {
    pub q: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

pub async fn list_channels(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(group_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let channels = state.registry.list(user, group_id).await?;
    let items: Vec<ChannelView> = channels.into_iter().map(ChannelView::from).collect();
    Ok(Json(serde_json::json!({ "ok": true, "items": items })))
}

pub async fn create_channel(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(group_id): Path<i64>,
    payload: Result<Json<CreateChannelRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body(payload)?;
    let channel = state
        .registry
        .create(user, group_id, &req.provider, &req.display_name)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "ok": true, "channel": ChannelView::from(channel) })),
    ))
}

pub async fn update_channel(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((group_id, channel_id)): Path<(i64, Uuid)>,
    payload: Result<Json<UpdateChannelRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body(payload)?;
    let update = ChannelUpdate {
        display_name: req.display_name,
        status: req.status,
        settings: req.settings,
    };
    let channel = state
        .registry
        .update(user, group_id, channel_id, update)
        .await?;
    Ok(Json(
        serde_json::json!({ "ok": true, "channel": ChannelView::from(channel) }),
    ))
}

pub async fn delete_channel(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((group_id, channel_id)): Path<(i64, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.delete(user, group_id, channel_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn connect_telegram(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((group_id, channel_id)): Path<(i64, Uuid)>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body(payload)?;
    let channel = state
        .registry
        .connect_telegram(user, group_id, channel_id, req.bot_token)
        .await?;
    Ok(Json(
        serde_json::json!({ "ok": true, "channel": ChannelView::from(channel) }),
    ))
}

pub async fn disconnect_telegram(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((group_id, channel_id)): Path<(i64, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state
        .registry
        .disconnect_telegram(user, group_id, channel_id)
        .await?;
    Ok(Json(
        serde_json::json!({ "ok": true, "channel": ChannelView::from(channel) }),
    ))
}

pub async fn list_threads(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((group_id, channel_id)): Path<(i64, Uuid)>,
    Query(query): Query<ThreadsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = PageRequest::clamped(
        query.page,
        query.per_page,
        THREADS_DEFAULT_PER_PAGE,
        THREADS_MAX_PER_PAGE,
    );
    let search = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty());
    let threads = state
        .registry
        .threads(user, group_id, channel_id, search, page)
        .await?;
    Ok(Json(threads))
}
