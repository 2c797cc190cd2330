//! Outbound dispatcher: member-initiated sends into a thread.
//!
//! Text goes to the provider synchronously. Files are staged, recorded as a
//! queued placeholder, and handed to the delivery queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channels::model::{
    ATTACHMENT_LABEL, Channel, ChannelStatus, Direction, Message, Page, PageRequest, Provider,
    Thread,
};
use crate::channels::registry::thread_for_member;
use crate::delivery::{DeliveryJob, DeliveryQueue};
use crate::error::{BridgeError, DatabaseError, ProviderError};
use crate::staging::StagedFile;
use crate::store::{Database, LastMessage, OutboundMessage};
use crate::telegram::{TELEGRAM_MAX_CAPTION_LENGTH, TELEGRAM_MAX_MESSAGE_LENGTH, TelegramClient};

pub const MESSAGES_DEFAULT_PER_PAGE: u32 = 50;
pub const MESSAGES_MAX_PER_PAGE: u32 = 200;

/// An uploaded file already written to the upload directory.
#[derive(Debug)]
pub struct OutgoingFile {
    pub staged: StagedFile,
    pub original_name: String,
    pub mime: Option<String>,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// Text confirmed by the provider.
    Sent(Message),
    /// File placeholder waiting for the delivery worker.
    Queued(Message),
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            SendOutcome::Sent(m) | SendOutcome::Queued(m) => m,
        }
    }
}

pub struct OutboundDispatcher {
    db: Arc<dyn Database>,
    client: TelegramClient,
    queue: Arc<DeliveryQueue>,
    max_upload_bytes: u64,
}

impl OutboundDispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        client: TelegramClient,
        queue: Arc<DeliveryQueue>,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            db,
            client,
            queue,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Messages of a thread, newest first.
    pub async fn messages(
        &self,
        user_id: i64,
        thread_id: Uuid,
        direction: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Message>, BridgeError> {
        let direction = match direction.map(str::trim).filter(|d| !d.is_empty()) {
            Some(raw) => Some(raw.parse::<Direction>().map_err(BridgeError::Validation)?),
            None => None,
        };
        let (thread, _) = thread_for_member(self.db.as_ref(), user_id, thread_id).await?;
        Ok(self.db.list_messages(thread.id, direction, page).await?)
    }

    /// Send text, a file, or both (the text becomes the file's caption).
    pub async fn send(
        &self,
        user_id: i64,
        thread_id: Uuid,
        text: Option<String>,
        file: Option<OutgoingFile>,
    ) -> Result<SendOutcome, BridgeError> {
        let (thread, channel) = thread_for_member(self.db.as_ref(), user_id, thread_id).await?;
        require_sendable(&channel)?;

        let text = text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if text
            .as_ref()
            .is_some_and(|t| t.chars().count() > TELEGRAM_MAX_MESSAGE_LENGTH)
        {
            return Err(BridgeError::Validation(format!(
                "text must be at most {TELEGRAM_MAX_MESSAGE_LENGTH} characters"
            )));
        }

        match (text, file) {
            (None, None) => Err(BridgeError::Validation(
                "Either text or file is required".into(),
            )),
            (text, Some(file)) => {
                if file.staged.size() > self.max_upload_bytes {
                    return Err(BridgeError::Validation(format!(
                        "file must be at most {} bytes",
                        self.max_upload_bytes
                    )));
                }
                self.queue_file(user_id, &thread, text, file).await
            }
            (Some(text), None) => self.send_text(user_id, &thread, &channel, &text).await,
        }
    }

    async fn send_text(
        &self,
        user_id: i64,
        thread: &Thread,
        channel: &Channel,
        text: &str,
    ) -> Result<SendOutcome, BridgeError> {
        let token = channel
            .bot_token()
            .ok_or_else(|| BridgeError::Validation("Telegram bot token is not configured".into()))?;

        let sent = match self
            .client
            .send_message(token, &thread.external_chat_id, text)
            .await
        {
            Ok(sent) => sent,
            Err(ProviderError::Unauthorized) => {
                warn!(channel_id = %channel.id, thread_id = %thread.id, "Bot token unauthorized on send");
                self.db.mark_channel_error(channel.id).await?;
                return Err(BridgeError::ReconnectRequired);
            }
            Err(e) => {
                warn!(channel_id = %channel.id, thread_id = %thread.id, error = %e, "sendMessage failed");
                return Err(BridgeError::Provider("Telegram send failed".into()));
            }
        };

        let echo = sent.text.clone().unwrap_or_else(|| text.to_string());
        let message = self
            .db
            .insert_outbound_message(&OutboundMessage {
                thread_id: thread.id,
                external_message_id: Some(sent.message_id.clone()),
                text: Some(echo.clone()),
                payload: sent.raw,
                queued: false,
                sent_at: sent.sent_at,
                created_by: Some(user_id),
            })
            .await?;
        self.db
            .touch_thread(
                thread.id,
                &LastMessage {
                    text: Some(echo),
                    at: sent.sent_at.unwrap_or_else(Utc::now),
                    external_id: Some(sent.message_id),
                },
            )
            .await?;

        info!(thread_id = %thread.id, message_id = %message.id, "Text sent");
        Ok(SendOutcome::Sent(message))
    }

    async fn queue_file(
        &self,
        user_id: i64,
        thread: &Thread,
        caption: Option<String>,
        file: OutgoingFile,
    ) -> Result<SendOutcome, BridgeError> {
        let OutgoingFile {
            staged,
            original_name,
            mime,
        } = file;
        let caption =
            caption.map(|c| c.chars().take(TELEGRAM_MAX_CAPTION_LENGTH).collect::<String>());
        let mime = mime.filter(|m| !m.trim().is_empty()).or_else(|| {
            mime_guess::from_path(&original_name)
                .first()
                .map(|m| m.essence_str().to_string())
        });
        let local_path = staged.path().to_string_lossy().into_owned();
        let now = Utc::now();

        let payload = serde_json::json!({
            "queued": true,
            "queued_at": now.to_rfc3339(),
            "upload": {
                "disk": "local",
                "path": local_path,
                "original_name": original_name,
                "mime": mime,
                "size": staged.size(),
            },
        });
        let message = self
            .db
            .insert_outbound_message(&OutboundMessage {
                thread_id: thread.id,
                external_message_id: None,
                text: caption.clone(),
                payload,
                queued: true,
                sent_at: None,
                created_by: Some(user_id),
            })
            .await?;
        // From here on the placeholder exists; any failure must settle it.
        let job = DeliveryJob {
            thread_id: thread.id,
            message_id: message.id,
            local_path,
            original_name,
            caption,
            mime,
        };
        if let Err(e) = self.hand_off(thread.id, job, now).await {
            error!(message_id = %message.id, "Failed to queue file delivery: {e}");
            if let Err(e) = self.db.mark_message_failed(message.id, "Failed to queue delivery").await {
                error!(message_id = %message.id, "Failed to mark message failed: {e}");
            }
            // `staged` drops here and removes the file.
            return Err(BridgeError::LocalResource("Failed to queue file delivery".into()));
        }
        staged.keep();

        info!(thread_id = %thread.id, message_id = %message.id, "File queued for delivery");
        Ok(SendOutcome::Queued(message))
    }

    /// Refresh the thread preview and enqueue the job.
    async fn hand_off(
        &self,
        thread_id: Uuid,
        job: DeliveryJob,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.db
            .touch_thread(
                thread_id,
                &LastMessage {
                    text: Some(
                        job.caption
                            .clone()
                            .unwrap_or_else(|| ATTACHMENT_LABEL.to_string()),
                    ),
                    at,
                    external_id: None,
                },
            )
            .await?;
        self.queue.enqueue(job).await?;
        Ok(())
    }
}

fn require_sendable(channel: &Channel) -> Result<(), BridgeError> {
    if channel.provider != Provider::Telegram {
        return Err(BridgeError::Validation(format!(
            "Sending is not supported for provider {}",
            channel.provider
        )));
    }
    if channel.status != ChannelStatus::Active {
        return Err(BridgeError::Validation(format!(
            "Channel is {}; sending requires an active channel",
            channel.status
        )));
    }
    if !channel.has_token() {
        return Err(BridgeError::Validation(
            "Telegram bot token is not configured".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::model::{
        ChannelSecrets, DeliveryStatus, GroupRole, TelegramSecrets,
    };
    use crate::config::{DeliveryConfig, TelegramConfig};
    use crate::store::{ChannelPatch, LibSqlBackend, ThreadUpsert};
    use secrecy::SecretString;
    use std::time::Duration;

    const TOKEN: &str = "123456:ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const GROUP: i64 = 10;
    const MEMBER: i64 = 2;
    const OUTSIDER: i64 = 3;

    struct Fixture {
        backend: Arc<LibSqlBackend>,
        db: Arc<dyn Database>,
        dispatcher: OutboundDispatcher,
        queue: Arc<DeliveryQueue>,
        channel_id: Uuid,
        thread_id: Uuid,
        dir: tempfile::TempDir,
    }

    async fn fixture(api_base: String) -> Fixture {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let db: Arc<dyn Database> = backend.clone();
        db.upsert_group_member(GROUP, MEMBER, GroupRole::Member).await.unwrap();
        let ch = db
            .create_channel(GROUP, &Provider::Telegram, "Bot")
            .await
            .unwrap();
        db.update_channel(
            ch.id,
            &ChannelPatch {
                status: Some(ChannelStatus::Active),
                secrets: Some(ChannelSecrets::Telegram(TelegramSecrets {
                    bot_token: Some(SecretString::from(TOKEN.to_string())),
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let thread_id = db
            .upsert_thread(&ThreadUpsert {
                channel_id: ch.id,
                external_chat_id: "555".into(),
                external_user_id: Some("555".into()),
                kind: Some("private".into()),
                title: None,
                username: Some("alice".into()),
                first_name: Some("Alice".into()),
                last_name: None,
                last_update_id: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let client = TelegramClient::new(TelegramConfig {
            api_base,
            retry_delay: Duration::from_millis(10),
            ..TelegramConfig::default()
        })
        .unwrap();
        let queue = Arc::new(DeliveryQueue::new(Arc::clone(&db), DeliveryConfig::default()));
        let dispatcher =
            OutboundDispatcher::new(Arc::clone(&db), client, Arc::clone(&queue), 1024);
        Fixture {
            backend,
            db,
            dispatcher,
            queue,
            channel_id: ch.id,
            thread_id,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn staged(dir: &std::path::Path, name: &str, bytes: &[u8]) -> StagedFile {
        let mut staged = StagedFile::for_upload(dir, name).await.unwrap();
        let mut w = staged.writer().await.unwrap();
        w.write_chunk(bytes).await.unwrap();
        w.finish().await.unwrap();
        staged
    }

    #[tokio::test]
    async fn text_send_persists_confirmed_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":900,"date":1700000000,"text":"hello","chat":{"id":555}}}"#)
            .expect(1)
            .create_async()
            .await;
        let fx = fixture(server.url()).await;

        let outcome = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("  hello ".into()), None)
            .await
            .unwrap();
        mock.assert_async().await;

        let SendOutcome::Sent(msg) = outcome else {
            panic!("expected a confirmed send");
        };
        assert_eq!(msg.direction, Direction::Outbound);
        assert_eq!(msg.external_message_id.as_deref(), Some("900"));
        assert_eq!(msg.text.as_deref(), Some("hello"));
        assert_eq!(msg.created_by, Some(MEMBER));

        let thread = fx.db.get_thread(fx.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_text.as_deref(), Some("hello"));
        assert_eq!(thread.last_message_external_id.as_deref(), Some("900"));
    }

    #[tokio::test]
    async fn unauthorized_send_marks_channel_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .with_status(401)
            .with_body(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
            .create_async()
            .await;
        let fx = fixture(server.url()).await;

        let err = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("hi".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ReconnectRequired));

        let ch = fx.db.get_channel(fx.channel_id).await.unwrap().unwrap();
        assert_eq!(ch.status, ChannelStatus::Error);
        let page = fx
            .dispatcher
            .messages(MEMBER, fx.thread_id, None, PageRequest::clamped(None, None, 50, 200))
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn provider_failure_creates_no_row() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("/bot{TOKEN}/sendMessage").as_str())
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"Bad Request: chat not found"}"#)
            .create_async()
            .await;
        let fx = fixture(server.url()).await;

        let err = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("hi".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Provider(_)));
        let ch = fx.db.get_channel(fx.channel_id).await.unwrap().unwrap();
        assert_eq!(ch.status, ChannelStatus::Active);
    }

    #[tokio::test]
    async fn file_send_queues_placeholder() {
        let fx = fixture("http://127.0.0.1:1".into()).await;
        let file = OutgoingFile {
            staged: staged(fx.dir.path(), "cat.png", b"png-bytes").await,
            original_name: "cat.png".into(),
            mime: None,
        };

        let outcome = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("look".into()), Some(file))
            .await
            .unwrap();
        let SendOutcome::Queued(msg) = outcome else {
            panic!("expected a queued send");
        };
        assert_eq!(msg.delivery_status, Some(DeliveryStatus::Queued));
        assert!(msg.external_message_id.is_none());
        assert_eq!(msg.text.as_deref(), Some("look"));
        assert_eq!(msg.payload["upload"]["mime"], "image/png");

        let path = msg.payload["upload"]["path"].as_str().unwrap().to_string();
        assert!(std::path::Path::new(&path).exists());

        let task = fx.queue.claim().await.unwrap().unwrap();
        assert_eq!(task.message_id, msg.id);
        assert_eq!(task.local_path, path);
        assert_eq!(task.caption.as_deref(), Some("look"));

        let thread = fx.db.get_thread(fx.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_text.as_deref(), Some("look"));
    }

    #[tokio::test]
    async fn failed_hand_off_settles_placeholder() {
        let fx = fixture("http://127.0.0.1:1".into()).await;
        fx.backend
            .execute_raw(
                "CREATE TRIGGER preview_boom BEFORE UPDATE OF last_message_text ON channel_threads
                 BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )
            .await
            .unwrap();
        let staged = staged(fx.dir.path(), "cat.png", b"png-bytes").await;
        let path = staged.path().to_path_buf();
        let file = OutgoingFile {
            staged,
            original_name: "cat.png".into(),
            mime: None,
        };

        let err = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("look".into()), Some(file))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::LocalResource(_)));
        assert!(!path.exists());
        assert!(fx.queue.claim().await.unwrap().is_none());

        let page = PageRequest::clamped(None, None, MESSAGES_DEFAULT_PER_PAGE, MESSAGES_MAX_PER_PAGE);
        let msgs = fx.db.list_messages(fx.thread_id, None, page).await.unwrap();
        assert_eq!(msgs.total, 1);
        assert_eq!(msgs.items[0].delivery_status, Some(DeliveryStatus::Failed));
        assert_eq!(
            msgs.items[0].delivery_error.as_deref(),
            Some("Failed to queue delivery")
        );
    }

    #[tokio::test]
    async fn file_without_caption_previews_attachment() {
        let fx = fixture("http://127.0.0.1:1".into()).await;
        let file = OutgoingFile {
            staged: staged(fx.dir.path(), "report.pdf", b"%PDF").await,
            original_name: "report.pdf".into(),
            mime: Some("application/pdf".into()),
        };
        fx.dispatcher
            .send(MEMBER, fx.thread_id, None, Some(file))
            .await
            .unwrap();

        let thread = fx.db.get_thread(fx.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_text.as_deref(), Some(ATTACHMENT_LABEL));
    }

    #[tokio::test]
    async fn caption_is_truncated() {
        let fx = fixture("http://127.0.0.1:1".into()).await;
        let file = OutgoingFile {
            staged: staged(fx.dir.path(), "a.txt", b"x").await,
            original_name: "a.txt".into(),
            mime: None,
        };
        let outcome = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("c".repeat(2000)), Some(file))
            .await
            .unwrap();
        assert_eq!(
            outcome.message().text.as_ref().unwrap().chars().count(),
            TELEGRAM_MAX_CAPTION_LENGTH
        );
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_and_removed() {
        let fx = fixture("http://127.0.0.1:1".into()).await;
        let staged = staged(fx.dir.path(), "big.bin", &[0u8; 2048]).await;
        let path = staged.path().to_path_buf();
        let file = OutgoingFile {
            staged,
            original_name: "big.bin".into(),
            mime: None,
        };

        let err = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, None, Some(file))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn send_preconditions() {
        let fx = fixture("http://127.0.0.1:1".into()).await;

        let err = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("   ".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        let err = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("x".repeat(4097)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        let err = fx
            .dispatcher
            .send(OUTSIDER, fx.thread_id, Some("hi".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Forbidden(_)));

        let err = fx
            .dispatcher
            .send(MEMBER, Uuid::new_v4(), Some("hi".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));

        fx.db
            .update_channel(
                fx.channel_id,
                &ChannelPatch {
                    status: Some(ChannelStatus::Disabled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = fx
            .dispatcher
            .send(MEMBER, fx.thread_id, Some("hi".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }

    #[tokio::test]
    async fn messages_rejects_unknown_direction() {
        let fx = fixture("http://127.0.0.1:1".into()).await;
        let page = PageRequest::clamped(None, None, MESSAGES_DEFAULT_PER_PAGE, MESSAGES_MAX_PER_PAGE);

        let err = fx
            .dispatcher
            .messages(MEMBER, fx.thread_id, Some("sideways"), page)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        let page = fx
            .dispatcher
            .messages(MEMBER, fx.thread_id, Some("in"), page)
            .await
            .unwrap();
        assert_eq!(page.per_page, MESSAGES_DEFAULT_PER_PAGE);
        assert!(page.items.is_empty());
    }
}
