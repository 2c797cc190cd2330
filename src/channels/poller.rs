//! Inbound poller: pulls provider updates and persists them to the DB.
//!
//! Each sweep walks every `active`/`error` Telegram channel in turn:
//! 1. Calls `getUpdates` with the stored cursor
//! 2. Upserts threads and inbound messages (idempotent)
//! 3. Advances the cursor to the highest update id seen
//!
//! A failing channel is moved to `error` and skipped until the next sweep;
//! it never affects other channels. Nothing here propagates errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::model::{ATTACHMENT_LABEL, Channel, ChannelStatus, Provider};
use crate::config::PollerConfig;
use crate::error::DatabaseError;
use crate::store::{Database, InboundMessage, LastMessage, ThreadUpsert};
use crate::telegram::{TelegramClient, TgMessage, Update};

/// Result of polling one channel, reported for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The provider returned no updates; nothing was written.
    Empty,
    /// A batch was processed.
    Ingested {
        updates: usize,
        stored: usize,
        cursor: Option<i64>,
    },
    /// The channel had no token and was marked `error`.
    NoToken,
    /// The provider call failed and the channel was marked `error`.
    Failed(String),
}

pub struct Poller {
    db: Arc<dyn Database>,
    client: TelegramClient,
    config: PollerConfig,
    sweep_guard: Mutex<()>,
}

impl Poller {
    pub fn new(db: Arc<dyn Database>, client: TelegramClient, config: PollerConfig) -> Self {
        Self {
            db,
            client,
            config,
            sweep_guard: Mutex::new(()),
        }
    }

    /// Poll every eligible channel once. Returns `None` if another sweep in
    /// this process is still running.
    pub async fn sweep(&self) -> Option<Vec<(Uuid, PollOutcome)>> {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            debug!("Previous sweep still running, skipping");
            return None;
        };

        let channels = match self.db.list_pollable_channels(&Provider::Telegram).await {
            Ok(channels) => channels,
            Err(e) => {
                error!("Failed to list pollable channels: {e}");
                return Some(Vec::new());
            }
        };

        let mut outcomes = Vec::with_capacity(channels.len());
        for channel in &channels {
            let outcome = self.poll_channel(channel).await;
            outcomes.push((channel.id, outcome));
        }
        Some(outcomes)
    }

    /// Poll a single channel.
    pub async fn poll_channel(&self, channel: &Channel) -> PollOutcome {
        let Some(token) = channel.bot_token() else {
            warn!(channel_id = %channel.id, "Channel has no bot token");
            self.mark_error(channel.id).await;
            return PollOutcome::NoToken;
        };

        let cursor = channel.settings.last_update_id();
        let offset = cursor.filter(|c| *c > 0).map(|c| c + 1);

        let raw_updates = match self
            .client
            .get_updates(
                token,
                offset,
                self.config.limit,
                self.config.long_poll_timeout_secs,
                self.config.request_timeout(),
            )
            .await
        {
            Ok(updates) => updates,
            Err(e) => {
                warn!(channel_id = %channel.id, error = %e, "getUpdates failed");
                self.mark_error(channel.id).await;
                return PollOutcome::Failed(e.to_string());
            }
        };

        if channel.status != ChannelStatus::Active {
            match self.db.restore_channel(channel.id).await {
                Ok(true) => info!(channel_id = %channel.id, "Channel recovered"),
                Ok(false) => {}
                Err(e) => error!(channel_id = %channel.id, "Failed to restore channel: {e}"),
            }
        }

        if raw_updates.is_empty() {
            return PollOutcome::Empty;
        }

        let mut max_update_id: Option<i64> = None;
        let mut stored = 0;
        for raw in &raw_updates {
            let Some(update) = Update::from_raw(raw) else {
                warn!(channel_id = %channel.id, "Update without update_id, skipping");
                continue;
            };

            // A failed update is logged and passed over; the cursor still
            // moves past it.
            match self.ingest(channel.id, &update).await {
                Ok(true) => stored += 1,
                Ok(false) => {}
                Err(e) => error!(
                    channel_id = %channel.id,
                    update_id = update.update_id,
                    "Failed to store update: {e}"
                ),
            }
            max_update_id = Some(max_update_id.map_or(update.update_id, |m| m.max(update.update_id)));
        }

        let new_cursor = match (max_update_id, cursor) {
            (Some(max), Some(old)) if max <= old => None,
            (max, _) => max,
        };
        if let Some(c) = new_cursor {
            if let Err(e) = self.db.save_cursor(channel.id, c).await {
                error!(channel_id = %channel.id, cursor = c, "Failed to save cursor: {e}");
            }
        }

        debug!(
            channel_id = %channel.id,
            updates = raw_updates.len(),
            stored,
            cursor = ?new_cursor.or(cursor),
            "Channel polled"
        );
        PollOutcome::Ingested {
            updates: raw_updates.len(),
            stored,
            cursor: new_cursor.or(cursor),
        }
    }

    /// Persist one update. `Ok(false)` means the update carried nothing to
    /// store (no message, no chat, or unparsable).
    async fn ingest(&self, channel_id: Uuid, update: &Update) -> Result<bool, DatabaseError> {
        let (Some(raw_message), Some(parsed)) = (update.raw_message.as_ref(), update.message()) else {
            debug!(%channel_id, update_id = update.update_id, "Update without message, skipping");
            return Ok(false);
        };
        let msg: TgMessage = match parsed {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%channel_id, update_id = update.update_id, "Malformed message: {e}");
                return Ok(false);
            }
        };
        let Some(chat) = msg.chat.as_ref().filter(|c| !c.id.is_empty()) else {
            debug!(%channel_id, update_id = update.update_id, "Message without chat, skipping");
            return Ok(false);
        };
        let Some(message_id) = msg.message_id.as_ref().filter(|id| !id.is_empty()) else {
            debug!(%channel_id, update_id = update.update_id, "Message without id, skipping");
            return Ok(false);
        };

        let from = msg.from.as_ref();
        let thread_id = self
            .db
            .upsert_thread(&ThreadUpsert {
                channel_id,
                external_chat_id: chat.id.to_string(),
                external_user_id: from.map(|u| u.id.to_string()),
                kind: chat.kind.clone(),
                title: chat.title.clone(),
                username: chat.username.clone().or_else(|| from.and_then(|u| u.username.clone())),
                first_name: chat
                    .first_name
                    .clone()
                    .or_else(|| from.and_then(|u| u.first_name.clone())),
                last_name: chat
                    .last_name
                    .clone()
                    .or_else(|| from.and_then(|u| u.last_name.clone())),
                last_update_id: Some(update.update_id),
                metadata: serde_json::json!({
                    "chat": raw_message.get("chat"),
                    "from": raw_message.get("from"),
                }),
            })
            .await?;

        let text = msg.body().map(str::to_string);
        let sent_at = msg.sent_at();
        self.db
            .upsert_inbound_message(&InboundMessage {
                thread_id,
                external_message_id: message_id.to_string(),
                external_update_id: update.update_id,
                sender_external_id: from.map(|u| u.id.to_string()),
                text: text.clone(),
                payload: raw_message.clone(),
                sent_at,
            })
            .await?;

        self.db
            .touch_thread_if_newer(
                thread_id,
                &LastMessage {
                    text: Some(text.unwrap_or_else(|| ATTACHMENT_LABEL.to_string())),
                    at: sent_at.unwrap_or_else(Utc::now),
                    external_id: Some(message_id.to_string()),
                },
            )
            .await?;

        Ok(true)
    }

    async fn mark_error(&self, channel_id: Uuid) {
        if let Err(e) = self.db.mark_channel_error(channel_id).await {
            error!(%channel_id, "Failed to mark channel error: {e}");
        }
    }
}

/// Spawn a background task that sweeps on a fixed interval.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_poller(poller: Arc<Poller>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = poller.config.interval.as_secs(),
            limit = poller.config.limit,
            "Inbound poller started"
        );

        let mut tick = tokio::time::interval(poller.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Inbound poller shutting down");
                return;
            }

            if let Some(outcomes) = poller.sweep().await {
                let failed = outcomes
                    .iter()
                    .filter(|(_, o)| matches!(o, PollOutcome::Failed(_) | PollOutcome::NoToken))
                    .count();
                if failed > 0 {
                    warn!(channels = outcomes.len(), failed, "Sweep finished with failures");
                }
            }
        }
    });

    (handle, shutdown_flag)
}
