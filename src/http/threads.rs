//! Thread routes: message history, sending, and file retrieval.

use axum::Json;
use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use super::auth::CurrentUser;
use super::error::ApiError;
use crate::channels::dispatcher::{MESSAGES_DEFAULT_PER_PAGE, MESSAGES_MAX_PER_PAGE};
use crate::channels::model::PageRequest;
use crate::channels::{OutgoingFile, SendOutcome};
use crate::error::BridgeError;
use crate::staging::StagedFile;

/// Scratch files are relayed in chunks of this size.
const RELAY_CHUNK_BYTES: usize = 1 << 20;

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub direction: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub file_id: String,
    #[serde(default)]
    pub download: Option<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = PageRequest::clamped(
        query.page,
        query.per_page,
        MESSAGES_DEFAULT_PER_PAGE,
        MESSAGES_MAX_PER_PAGE,
    );
    let messages = state
        .dispatcher
        .messages(user, thread_id, query.direction.as_deref(), page)
        .await?;
    Ok(Json(messages))
}

/// `POST /threads/{thread}/messages` with a JSON `{text}` body or a
/// multipart form carrying `text` and/or `file`.
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(thread_id): Path<Uuid>,
    request: Request,
) -> Result<impl IntoResponse, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let (text, file) = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        read_form(&state, multipart).await?
    } else {
        let Json(req) = Json::<SendTextRequest>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        (req.text, None)
    };

    let outcome = state.dispatcher.send(user, thread_id, text, file).await?;
    let status = match outcome {
        SendOutcome::Sent(_) => StatusCode::CREATED,
        SendOutcome::Queued(_) => StatusCode::ACCEPTED,
    };
    Ok((
        status,
        Json(serde_json::json!({
            "ok": true,
            "queued": status == StatusCode::ACCEPTED,
            "message": outcome.message(),
        })),
    ))
}

async fn read_form(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<(Option<String>, Option<OutgoingFile>), ApiError> {
    let mut text = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        match field.name() {
            Some("text") => {
                text = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.body_text()))?,
                );
            }
            Some("file") => file = Some(stage_upload(state, field).await?),
            _ => {}
        }
    }
    Ok((text, file))
}

/// Stream an uploaded part to the upload directory, enforcing the size
/// limit as bytes arrive.
async fn stage_upload(state: &AppState, mut field: Field<'_>) -> Result<OutgoingFile, ApiError> {
    let original_name = field
        .file_name()
        .map(str::to_string)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "upload.bin".to_string());
    let mime = field.content_type().map(str::to_string);
    let limit = state.dispatcher.max_upload_bytes();

    let mut staged = StagedFile::for_upload(&state.upload_dir, &original_name).await?;
    let mut writer = staged.writer().await?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if writer.written() + chunk.len() as u64 > limit {
            return Err(BridgeError::Validation(format!("file must be at most {limit} bytes")).into());
        }
        writer.write_chunk(&chunk).await?;
    }
    let size = writer.finish().await?;
    debug!(original_name = %original_name, size, "Upload staged");

    Ok(OutgoingFile {
        staged,
        original_name,
        // Browsers send this for unknown types; treat it as absent.
        mime: mime.filter(|m| m != "application/octet-stream"),
    })
}

/// `GET /threads/{thread}/files/download?file_id=&download=`
pub async fn download_file(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let download = matches!(
        query.download.as_deref().map(str::trim),
        Some("1" | "true" | "yes")
    );
    let retrieved = state
        .files
        .fetch(user, thread_id, &query.file_id, download)
        .await?;

    let file = tokio::fs::File::open(retrieved.staged.path())
        .await
        .map_err(|e| BridgeError::LocalResource(format!("Cannot read downloaded file: {e}")))?;

    let headers = [
        (header::CONTENT_TYPE, retrieved.content_type.to_string()),
        (header::CONTENT_DISPOSITION, retrieved.disposition()),
        (header::CONTENT_LENGTH, retrieved.size.to_string()),
        (
            header::CACHE_CONTROL,
            "private, max-age=0, no-cache, no-store, must-revalidate".to_string(),
        ),
        (header::PRAGMA, "no-cache".to_string()),
        (header::EXPIRES, "0".to_string()),
    ];

    // The stream owns the scratch file guard; it is deleted when the body
    // completes or the client goes away.
    let stream = ReaderStream::with_capacity(file, RELAY_CHUNK_BYTES);
    let guarded = futures::stream::unfold(
        (stream, retrieved),
        |(mut stream, guard)| async move {
            stream.next().await.map(|item| (item, (stream, guard)))
        },
    );
    Ok((headers, Body::from_stream(guarded)).into_response())
}
