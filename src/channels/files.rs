//! File retrieval proxy: relays provider-hosted files to members.
//!
//! The bot token is part of the provider's download URL, so files are
//! fetched server-side into a scratch file and streamed from there.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channels::model::{ChannelStatus, Provider};
use crate::channels::registry::thread_for_member;
use crate::error::{BridgeError, ProviderError};
use crate::staging::StagedFile;
use crate::store::Database;
use crate::telegram::TelegramClient;

const MIN_FILE_ID_LEN: usize = 5;
const MAX_FILE_ID_LEN: usize = 255;

/// A downloaded file ready to be streamed back. Dropping it deletes the
/// scratch copy.
#[derive(Debug)]
pub struct RetrievedFile {
    pub staged: StagedFile,
    pub file_name: String,
    pub content_type: &'static str,
    pub size: u64,
    pub download: bool,
}

impl RetrievedFile {
    /// `Content-Disposition` value for this file.
    pub fn disposition(&self) -> String {
        let kind = if self.download { "attachment" } else { "inline" };
        format!("{kind}; filename=\"{}\"", self.file_name.replace('"', ""))
    }
}

pub struct FileProxy {
    db: Arc<dyn Database>,
    client: TelegramClient,
    temp_dir: PathBuf,
}

impl FileProxy {
    pub fn new(db: Arc<dyn Database>, client: TelegramClient, temp_dir: PathBuf) -> Self {
        Self {
            db,
            client,
            temp_dir,
        }
    }

    pub async fn fetch(
        &self,
        user_id: i64,
        thread_id: Uuid,
        file_id: &str,
        download: bool,
    ) -> Result<RetrievedFile, BridgeError> {
        let file_id = file_id.trim();
        let len = file_id.chars().count();
        if !(MIN_FILE_ID_LEN..=MAX_FILE_ID_LEN).contains(&len) {
            return Err(BridgeError::Validation(format!(
                "file_id must be {MIN_FILE_ID_LEN}-{MAX_FILE_ID_LEN} characters"
            )));
        }

        let (thread, channel) = thread_for_member(self.db.as_ref(), user_id, thread_id).await?;
        if channel.provider != Provider::Telegram {
            return Err(BridgeError::Validation(format!(
                "File retrieval is not supported for provider {}",
                channel.provider
            )));
        }
        if channel.status == ChannelStatus::Disabled {
            return Err(BridgeError::Validation("Channel is disabled".into()));
        }
        let token = channel
            .bot_token()
            .ok_or_else(|| BridgeError::Validation("Telegram bot token is not configured".into()))?;

        let info = match self.client.get_file(token, file_id).await {
            Ok(info) => info,
            Err(ProviderError::Unauthorized) => {
                warn!(channel_id = %channel.id, "Bot token unauthorized on getFile");
                self.db.mark_channel_error(channel.id).await?;
                return Err(BridgeError::ReconnectRequired);
            }
            Err(e) => {
                warn!(channel_id = %channel.id, thread_id = %thread.id, error = %e, "getFile failed");
                return Err(BridgeError::Provider("Telegram file lookup failed".into()));
            }
        };
        let file_path = info
            .file_path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| BridgeError::NotFound("File not found".into()))?;

        let response = match self.client.download_file(token, &file_path).await {
            Ok(resp) => resp,
            Err(ProviderError::Unauthorized) => {
                self.db.mark_channel_error(channel.id).await?;
                return Err(BridgeError::ReconnectRequired);
            }
            Err(e) => {
                warn!(channel_id = %channel.id, error = %e, "File download failed");
                return Err(BridgeError::Provider("Telegram file download failed".into()));
            }
        };

        let file_name = file_path
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or(file_id)
            .to_string();
        let mut staged = StagedFile::for_download(&self.temp_dir, &file_name).await?;
        let mut writer = staged.writer().await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                warn!(channel_id = %channel.id, error = %ProviderError::from(e), "File download interrupted");
                BridgeError::Provider("Telegram file download failed".into())
            })?;
            writer.write_chunk(&chunk).await?;
        }
        let size = writer.finish().await?;

        debug!(thread_id = %thread.id, size, "File relayed to scratch storage");
        Ok(RetrievedFile {
            content_type: content_type_for(&file_name),
            staged,
            file_name,
            size,
            download,
        })
    }
}

/// Content type from a small extension table.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        "rar" => "application/vnd.rar",
        "7z" => "application/x-7z-compressed",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}
