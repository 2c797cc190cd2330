//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channels::model::{
    Channel, ChannelSecrets, ChannelSettings, ChannelStatus, Direction, GroupRole, Message, Page,
    PageRequest, Provider, Thread,
};
use crate::error::DatabaseError;

/// Partial update of a channel's administrator-editable fields.
#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
    pub display_name: Option<String>,
    pub status: Option<ChannelStatus>,
    pub settings: Option<ChannelSettings>,
    pub secrets: Option<ChannelSecrets>,
}

/// Thread fields refreshed from an inbound update.
#[derive(Debug, Clone)]
pub struct ThreadUpsert {
    pub channel_id: Uuid,
    pub external_chat_id: String,
    pub external_user_id: Option<String>,
    pub kind: Option<String>,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub last_update_id: Option<i64>,
    pub metadata: serde_json::Value,
}

/// An inbound message keyed by (thread, external_message_id, `in`).
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub thread_id: Uuid,
    pub external_message_id: String,
    pub external_update_id: i64,
    pub sender_external_id: Option<String>,
    pub text: Option<String>,
    pub payload: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
}

/// An outbound message created by a member: either already confirmed by the
/// provider (text path) or a queued placeholder (file path).
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub thread_id: Uuid,
    pub external_message_id: Option<String>,
    pub text: Option<String>,
    pub payload: serde_json::Value,
    pub queued: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_by: Option<i64>,
}

/// Provider confirmation written over a placeholder.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub external_message_id: String,
    pub text: Option<String>,
    pub payload: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Denormalized last-message fields of a thread.
#[derive(Debug, Clone)]
pub struct LastMessage {
    pub text: Option<String>,
    pub at: DateTime<Utc>,
    pub external_id: Option<String>,
}

/// Queue bookkeeping state of a delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Buried,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Buried => "buried",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "buried" => Ok(TaskStatus::Buried),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Payload of a file delivery job.
#[derive(Debug, Clone)]
pub struct NewDeliveryTask {
    pub thread_id: Uuid,
    pub message_id: Uuid,
    pub local_path: String,
    pub original_name: String,
    pub caption: Option<String>,
    pub mime: Option<String>,
    pub max_attempts: u32,
}

/// A persisted delivery task.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub message_id: Uuid,
    pub local_path: String,
    pub original_name: String,
    pub caption: Option<String>,
    pub mime: Option<String>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryTask {
    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Backend-agnostic database trait covering channels, threads, messages,
/// the group directory, and the delivery queue.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Group directory ─────────────────────────────────────────────

    /// Role of `user_id` in `group_id`, `None` for non-members.
    async fn group_role(&self, group_id: i64, user_id: i64)
    -> Result<Option<GroupRole>, DatabaseError>;

    /// Insert or replace a membership row (seeding and tests).
    async fn upsert_group_member(
        &self,
        group_id: i64,
        user_id: i64,
        role: GroupRole,
    ) -> Result<(), DatabaseError>;

    // ── Channels ────────────────────────────────────────────────────

    /// Insert a channel. Fails with `Constraint` when the (group, provider)
    /// pair is taken.
    async fn create_channel(
        &self,
        group_id: i64,
        provider: &Provider,
        display_name: &str,
    ) -> Result<Channel, DatabaseError>;

    async fn get_channel(&self, id: Uuid) -> Result<Option<Channel>, DatabaseError>;

    async fn list_channels(&self, group_id: i64) -> Result<Vec<Channel>, DatabaseError>;

    /// Channels of `provider` whose status is `active` or `error`.
    async fn list_pollable_channels(
        &self,
        provider: &Provider,
    ) -> Result<Vec<Channel>, DatabaseError>;

    /// Apply a partial update and return the fresh row.
    async fn update_channel(
        &self,
        id: Uuid,
        patch: &ChannelPatch,
    ) -> Result<Option<Channel>, DatabaseError>;

    /// Move a channel to `error` only while it is `active` or `error`.
    /// Returns whether a row was changed.
    async fn mark_channel_error(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Move a channel from `error` back to `active`. Returns whether a row
    /// was changed.
    async fn restore_channel(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Atomically set `settings.last_update_id`.
    async fn save_cursor(&self, id: Uuid, last_update_id: i64) -> Result<(), DatabaseError>;

    /// Delete a channel; threads and messages cascade.
    async fn delete_channel(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    /// Upsert keyed by (channel, external_chat_id).
    async fn upsert_thread(&self, thread: &ThreadUpsert) -> Result<Uuid, DatabaseError>;

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError>;

    /// Threads of a channel, most recently active first, optionally
    /// filtered by a search term.
    async fn list_threads(
        &self,
        channel_id: Uuid,
        query: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Thread>, DatabaseError>;

    /// Overwrite the last-message fields unconditionally.
    async fn touch_thread(&self, id: Uuid, last: &LastMessage) -> Result<(), DatabaseError>;

    /// Overwrite the last-message fields unless they already describe a
    /// newer message.
    async fn touch_thread_if_newer(
        &self,
        id: Uuid,
        last: &LastMessage,
    ) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Idempotent insert keyed by (thread, external_message_id, `in`).
    async fn upsert_inbound_message(&self, msg: &InboundMessage) -> Result<Uuid, DatabaseError>;

    async fn insert_outbound_message(&self, msg: &OutboundMessage) -> Result<Message, DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    /// Messages of a thread, newest first.
    async fn list_messages(
        &self,
        thread_id: Uuid,
        direction: Option<Direction>,
        page: PageRequest,
    ) -> Result<Page<Message>, DatabaseError>;

    /// Reconcile a placeholder with the provider's confirmation.
    async fn mark_message_sent(
        &self,
        id: Uuid,
        receipt: &DeliveryReceipt,
    ) -> Result<Option<Message>, DatabaseError>;

    async fn mark_message_failed(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError>;

    // ── Delivery queue ──────────────────────────────────────────────

    async fn enqueue_delivery(&self, task: &NewDeliveryTask) -> Result<Uuid, DatabaseError>;

    /// Claim the oldest ready task, granting a lease until `lease_until`.
    async fn claim_delivery(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<DeliveryTask>, DatabaseError>;

    async fn complete_delivery(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Release a task for another attempt at `available_at`.
    async fn retry_delivery(
        &self,
        id: Uuid,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Give up on a task for good.
    async fn bury_delivery(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Bury running tasks whose lease expired with no attempts left and
    /// return them.
    async fn reap_expired_deliveries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryTask>, DatabaseError>;

    async fn get_delivery(&self, id: Uuid) -> Result<Option<DeliveryTask>, DatabaseError>;
}
