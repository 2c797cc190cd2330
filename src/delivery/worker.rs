//! Delivery worker: uploads staged files and reconciles placeholders.
//!
//! One invocation handles one task. The staged file is adopted on the first
//! line so it is removed on every exit path, including a timeout. The only
//! exception is a transient storage failure before any provider call: the
//! file is then left in place for the next attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::model::ATTACHMENT_LABEL;
use crate::delivery::queue::DeliveryQueue;
use crate::error::{DatabaseError, ProviderError};
use crate::staging::StagedFile;
use crate::store::{Database, DeliveryReceipt, DeliveryTask, LastMessage};
use crate::telegram::{MediaKind, MediaUpload, TelegramClient};

/// How a single delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Terminal failure; the message is marked `failed` with this text.
    Failed(String),
    /// Transient storage failure before any provider call.
    Retry(String),
}

pub struct DeliveryWorker {
    db: Arc<dyn Database>,
    client: TelegramClient,
    queue: Arc<DeliveryQueue>,
}

impl DeliveryWorker {
    pub fn new(db: Arc<dyn Database>, client: TelegramClient, queue: Arc<DeliveryQueue>) -> Self {
        Self { db, client, queue }
    }

    /// Claim and run one task. Returns `false` when the queue was empty.
    pub async fn run_next(&self) -> bool {
        match self.queue.claim().await {
            Ok(Some(task)) => {
                self.run(&task).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Failed to claim delivery task: {e}");
                false
            }
        }
    }

    /// Run one claimed task under the job timeout and record the result.
    pub async fn run(&self, task: &DeliveryTask) -> DeliveryOutcome {
        let started = Instant::now();
        let job_timeout = self.queue.config().job_timeout;
        let outcome = match tokio::time::timeout(job_timeout, self.process(task)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Failed(format!(
                "Delivery timed out after {}s",
                job_timeout.as_secs()
            )),
        };
        self.settle(task, &outcome).await;

        debug!(
            task_id = %task.id,
            message_id = %task.message_id,
            attempt = task.attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "Delivery attempt finished"
        );
        outcome
    }

    /// The delivery itself. Never propagates; every failure becomes an
    /// outcome.
    pub async fn process(&self, task: &DeliveryTask) -> DeliveryOutcome {
        let staged = StagedFile::adopt(&task.local_path);

        let message = match self.db.get_message(task.message_id).await {
            Ok(Some(m)) => m,
            Ok(None) => return DeliveryOutcome::Failed("Message not found".into()),
            Err(e) => return retry_later(staged, e),
        };
        let thread = match self.db.get_thread(task.thread_id).await {
            Ok(Some(t)) => t,
            Ok(None) => return DeliveryOutcome::Failed("Thread not found".into()),
            Err(e) => return retry_later(staged, e),
        };
        let channel = match self.db.get_channel(thread.channel_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return DeliveryOutcome::Failed("Channel not found".into()),
            Err(e) => return retry_later(staged, e),
        };
        let Some(token) = channel.bot_token() else {
            return DeliveryOutcome::Failed("Telegram bot token is not configured".into());
        };

        let not_found = || format!("Local file not found: {}", task.local_path);
        if !tokio::fs::try_exists(staged.path()).await.unwrap_or(false) {
            return DeliveryOutcome::Failed(not_found());
        }

        let kind = MediaKind::from_mime(task.mime.as_deref());
        let method = kind.method();
        let upload = MediaUpload {
            path: staged.path(),
            file_name: &task.original_name,
            mime: task.mime.as_deref(),
            caption: task.caption.as_deref(),
        };

        let sent = match self
            .client
            .send_media(token, &thread.external_chat_id, kind, &upload)
            .await
        {
            Ok(sent) => sent,
            Err(ProviderError::LocalFile(_)) => return DeliveryOutcome::Failed(not_found()),
            Err(ProviderError::Rejected(ref d)) => {
                warn!(task_id = %task.id, method, description = %d, "Upload rejected");
                return DeliveryOutcome::Failed(format!("Telegram {method} ok=false"));
            }
            Err(e) => {
                warn!(task_id = %task.id, method, error = %e, "Upload failed");
                return DeliveryOutcome::Failed(format!("Telegram {method} failed"));
            }
        };

        let text = sent
            .caption
            .clone()
            .or_else(|| sent.text.clone())
            .or_else(|| task.caption.clone());
        let receipt = DeliveryReceipt {
            external_message_id: sent.message_id.clone(),
            text: text.clone(),
            payload: sent.raw.clone(),
            sent_at: sent.sent_at,
        };
        if let Err(e) = self.db.mark_message_sent(message.id, &receipt).await {
            error!(message_id = %message.id, "Upload accepted but not recorded: {e}");
            return DeliveryOutcome::Failed("Delivered, but the result could not be saved".into());
        }

        let preview = text
            .or(message.text)
            .unwrap_or_else(|| ATTACHMENT_LABEL.to_string());
        if let Err(e) = self
            .db
            .touch_thread(
                thread.id,
                &LastMessage {
                    text: Some(preview),
                    at: sent.sent_at.unwrap_or_else(Utc::now),
                    external_id: Some(sent.message_id),
                },
            )
            .await
        {
            warn!(thread_id = %thread.id, "Failed to refresh thread preview: {e}");
        }

        DeliveryOutcome::Delivered
    }

    async fn settle(&self, task: &DeliveryTask, outcome: &DeliveryOutcome) {
        let result = match outcome {
            DeliveryOutcome::Delivered => {
                info!(task_id = %task.id, message_id = %task.message_id, "File delivered");
                self.queue.complete(task.id).await
            }
            DeliveryOutcome::Failed(reason) => {
                warn!(task_id = %task.id, message_id = %task.message_id, reason = %reason, "Delivery failed");
                self.fail_message(task, reason).await;
                self.queue.bury(task.id, reason).await
            }
            DeliveryOutcome::Retry(reason) if task.attempts_left() => {
                warn!(task_id = %task.id, attempt = task.attempts, reason = %reason, "Delivery will be retried");
                self.queue.retry(task.id, reason).await
            }
            DeliveryOutcome::Retry(reason) => {
                drop(StagedFile::adopt(&task.local_path));
                self.fail_message(task, reason).await;
                self.queue.bury(task.id, reason).await
            }
        };
        if let Err(e) = result {
            error!(task_id = %task.id, "Failed to record delivery outcome: {e}");
        }
    }

    async fn fail_message(&self, task: &DeliveryTask, reason: &str) {
        match self.db.mark_message_failed(task.message_id, reason).await {
            Ok(_) => {}
            Err(e) => error!(message_id = %task.message_id, "Failed to mark message failed: {e}"),
        }
    }

    /// Fail the placeholders of tasks whose consumers vanished and remove
    /// their staged files.
    pub async fn reap_abandoned(&self) -> usize {
        let tasks = match self.queue.reap_expired().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to reap expired deliveries: {e}");
                return 0;
            }
        };
        for task in &tasks {
            warn!(task_id = %task.id, attempts = task.attempts, "Delivery abandoned");
            drop(StagedFile::adopt(&task.local_path));
            self.fail_message(task, "Delivery abandoned after repeated attempts")
                .await;
        }
        tasks.len()
    }
}

fn retry_later(staged: StagedFile, err: DatabaseError) -> DeliveryOutcome {
    let _ = staged.keep();
    DeliveryOutcome::Retry(err.to_string())
}

/// Spawn `config.workers` consumers sharing one worker.
///
/// Returns the handles and a shutdown flag. Set the flag to stop claiming;
/// in-flight deliveries run to completion.
pub fn spawn_delivery_workers(
    worker: Arc<DeliveryWorker>,
) -> (Vec<JoinHandle<()>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let count = worker.queue.config().workers.max(1);
    let idle = worker.queue.config().idle_poll;

    let handles = (0..count)
        .map(|n| {
            let worker = Arc::clone(&worker);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                info!(consumer = n, "Delivery consumer started");
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        info!(consumer = n, "Delivery consumer shutting down");
                        return;
                    }
                    if n == 0 {
                        worker.reap_abandoned().await;
                    }
                    if !worker.run_next().await {
                        worker.queue.wait(idle).await;
                    }
                }
            })
        })
        .collect();

    (handles, shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::model::{
        ChannelSecrets, ChannelStatus, DeliveryStatus, Provider, TelegramSecrets,
    };
    use crate::config::{DeliveryConfig, TelegramConfig};
    use crate::delivery::queue::DeliveryJob;
    use crate::store::{ChannelPatch, LibSqlBackend, OutboundMessage, TaskStatus, ThreadUpsert};
    use mockito::Matcher;
    use secrecy::SecretString;
    use std::path::PathBuf;
    use std::time::Duration;
    use uuid::Uuid;

    const TOKEN: &str = "123456:ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    struct Fixture {
        backend: Arc<LibSqlBackend>,
        db: Arc<dyn Database>,
        worker: DeliveryWorker,
        queue: Arc<DeliveryQueue>,
        thread_id: Uuid,
        dir: tempfile::TempDir,
    }

    async fn fixture(server: &mockito::ServerGuard, config: DeliveryConfig) -> Fixture {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let db: Arc<dyn Database> = backend.clone();
        let ch = db
            .create_channel(1, &Provider::Telegram, "Bot")
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
                external_user_id: None,
                kind: Some("private".into()),
                title: None,
                username: None,
                first_name: None,
                last_name: None,
                last_update_id: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let client = TelegramClient::new(TelegramConfig {
            api_base: server.url(),
            retry_delay: Duration::from_millis(10),
            ..TelegramConfig::default()
        })
        .unwrap();
        let queue = Arc::new(DeliveryQueue::new(Arc::clone(&db), config));
        let worker = DeliveryWorker::new(Arc::clone(&db), client, Arc::clone(&queue));
        Fixture {
            backend,
            db,
            worker,
            queue,
            thread_id,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        async fn queue_file(&self, name: &str, mime: &str, caption: Option<&str>) -> (Uuid, PathBuf) {
            let path = self.dir.path().join(format!("tg_test_{name}"));
            std::fs::write(&path, b"file-bytes").unwrap();
            let msg = self
                .db
                .insert_outbound_message(&OutboundMessage {
                    thread_id: self.thread_id,
                    external_message_id: None,
                    text: caption.map(str::to_string),
                    payload: serde_json::json!({"queued": true}),
                    queued: true,
                    sent_at: None,
                    created_by: Some(7),
                })
                .await
                .unwrap();
            self.queue
                .enqueue(DeliveryJob {
                    thread_id: self.thread_id,
                    message_id: msg.id,
                    local_path: path.to_string_lossy().into_owned(),
                    original_name: name.into(),
                    caption: caption.map(str::to_string),
                    mime: Some(mime.into()),
                })
                .await
                .unwrap();
            (msg.id, path)
        }
    }

    #[tokio::test]
    async fn image_is_sent_and_placeholder_reconciled() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", format!("/bot{TOKEN}/sendPhoto").as_str())
            .match_body(Matcher::Regex(r#"name="photo""#.into()))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":321,"date":1700000000,"caption":"look","chat":{"id":555}}}"#)
            .create_async()
            .await;
        let fx = fixture(&server, DeliveryConfig::default()).await;
        let (msg_id, path) = fx.queue_file("cat.png", "image/png", Some("look")).await;

        assert!(fx.worker.run_next().await);
        mock.assert_async().await;

        let msg = fx.db.get_message(msg_id).await.unwrap().unwrap();
        assert_eq!(msg.delivery_status, Some(DeliveryStatus::Sent));
        assert_eq!(msg.external_message_id.as_deref(), Some("321"));
        assert_eq!(msg.text.as_deref(), Some("look"));
        assert_eq!(msg.payload["message_id"], serde_json::json!(321));
        assert!(!path.exists());

        let thread = fx.db.get_thread(fx.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_external_id.as_deref(), Some("321"));
        assert_eq!(thread.last_message_text.as_deref(), Some("look"));
    }

    #[tokio::test]
    async fn missing_staged_file_fails_message() {
        let server = mockito::Server::new_async().await;
        let fx = fixture(&server, DeliveryConfig::default()).await;
        let (msg_id, path) = fx.queue_file("doc.pdf", "application/pdf", None).await;
        std::fs::remove_file(&path).unwrap();

        assert!(fx.worker.run_next().await);

        let msg = fx.db.get_message(msg_id).await.unwrap().unwrap();
        assert_eq!(msg.delivery_status, Some(DeliveryStatus::Failed));
        assert!(msg.delivery_error.unwrap().starts_with("Local file not found"));
    }

    #[tokio::test]
    async fn provider_error_fails_message_and_removes_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("/bot{TOKEN}/sendDocument").as_str())
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"Bad Request: file is too big"}"#)
            .create_async()
            .await;
        let fx = fixture(&server, DeliveryConfig::default()).await;
        let (msg_id, path) = fx.queue_file("big.zip", "application/zip", None).await;

        fx.worker.run_next().await;

        let msg = fx.db.get_message(msg_id).await.unwrap().unwrap();
        assert_eq!(msg.delivery_status, Some(DeliveryStatus::Failed));
        assert_eq!(msg.delivery_error.as_deref(), Some("Telegram sendDocument failed"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn ok_false_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("/bot{TOKEN}/sendAudio").as_str())
            .with_status(200)
            .with_body(r#"{"ok":false,"description":"nope"}"#)
            .create_async()
            .await;
        let fx = fixture(&server, DeliveryConfig::default()).await;
        let (msg_id, _) = fx.queue_file("song.mp3", "audio/mpeg", None).await;

        fx.worker.run_next().await;
        let msg = fx.db.get_message(msg_id).await.unwrap().unwrap();
        assert_eq!(msg.delivery_error.as_deref(), Some("Telegram sendAudio ok=false"));
    }

    #[tokio::test]
    async fn deleted_thread_is_fatal_for_task() {
        let server = mockito::Server::new_async().await;
        let fx = fixture(&server, DeliveryConfig::default()).await;
        let (_msg_id, path) = fx.queue_file("cat.png", "image/png", None).await;
        let channel_id = fx
            .db
            .get_thread(fx.thread_id)
            .await
            .unwrap()
            .unwrap()
            .channel_id;
        fx.db.delete_channel(channel_id).await.unwrap();

        let task = fx.queue.claim().await.unwrap().unwrap();
        let outcome = fx.worker.run(&task).await;
        assert_eq!(outcome, DeliveryOutcome::Failed("Message not found".into()));
        assert!(!path.exists());
        assert_eq!(
            fx.db.get_delivery(task.id).await.unwrap().unwrap().status,
            TaskStatus::Buried
        );
    }

    #[tokio::test]
    async fn rerun_after_success_fails_on_missing_file() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", format!("/bot{TOKEN}/sendPhoto").as_str())
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":321,"date":1700000000,"chat":{"id":555}}}"#)
            .expect(1)
            .create_async()
            .await;
        let fx = fixture(&server, DeliveryConfig::default()).await;
        let (msg_id, path) = fx.queue_file("cat.png", "image/png", None).await;

        let task = fx.queue.claim().await.unwrap().unwrap();
        assert_eq!(fx.worker.run(&task).await, DeliveryOutcome::Delivered);
        assert!(!path.exists());

        let second = fx.worker.run(&task).await;
        assert!(matches!(second, DeliveryOutcome::Failed(ref r) if r.starts_with("Local file not found")));
        mock.assert_async().await;

        let msg = fx.db.get_message(msg_id).await.unwrap().unwrap();
        assert_eq!(msg.delivery_status, Some(DeliveryStatus::Failed));
        assert!(msg.delivery_error.unwrap().starts_with("Local file not found"));
    }

    #[tokio::test]
    async fn abandoned_task_is_reaped() {
        let server = mockito::Server::new_async().await;
        let fx = fixture(
            &server,
            DeliveryConfig {
                max_attempts: 1,
                ..DeliveryConfig::default()
            },
        )
        .await;
        let (msg_id, path) = fx.queue_file("cat.png", "image/png", None).await;

        // Claimed by a consumer that never reports back, lease long gone.
        let task = fx.queue.claim().await.unwrap().unwrap();
        fx.backend
            .execute_raw(
                "UPDATE delivery_tasks SET lease_expires_at = '2000-01-01T00:00:00.000Z'",
            )
            .await
            .unwrap();

        assert_eq!(fx.worker.reap_abandoned().await, 1);
        assert_eq!(fx.worker.reap_abandoned().await, 0);

        let msg = fx.db.get_message(msg_id).await.unwrap().unwrap();
        assert_eq!(msg.delivery_status, Some(DeliveryStatus::Failed));
        assert_eq!(
            msg.delivery_error.as_deref(),
            Some("Delivery abandoned after repeated attempts")
        );
        assert!(!path.exists());
        assert_eq!(
            fx.db.get_delivery(task.id).await.unwrap().unwrap().status,
            TaskStatus::Buried
        );
    }
}
