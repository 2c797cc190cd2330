//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text so that lexical order is chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::channels::model::{
    Channel, ChannelSecrets, ChannelSettings, ChannelStatus, DeliveryStatus, Direction, GroupRole,
    Message, Page, PageRequest, Provider, Thread,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ChannelPatch, Database, DeliveryReceipt, DeliveryTask, InboundMessage, LastMessage,
    NewDeliveryTask, OutboundMessage, TaskStatus, ThreadUpsert,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run raw SQL against the connection, e.g. to install a failing
    /// trigger in a test.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch(sql)
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_raw: {e}")))?;
        Ok(())
    }

    /// Run a `SELECT COUNT(*)`-shaped query.
    async fn count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?
        {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            None => Ok(0),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every TEXT time column.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_ts() -> String {
    fmt_ts(&Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_json(s: Option<String>) -> serde_json::Value {
    s.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

fn decode(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row decode: {e}"))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_i64(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

const CHANNEL_COLUMNS: &str =
    "id, group_id, provider, display_name, status, settings, secrets, created_at, updated_at";

const THREAD_COLUMNS: &str = "id, channel_id, external_chat_id, external_user_id, kind, title, username, first_name, last_name, last_update_id, metadata, last_message_text, last_message_at, last_message_external_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, thread_id, direction, external_message_id, external_update_id, sender_external_id, text, payload, delivery_status, delivery_error, sent_at, created_by, created_at, updated_at";

const TASK_COLUMNS: &str = "id, thread_id, message_id, local_path, original_name, caption, mime, status, attempts, max_attempts, lease_expires_at, last_error, created_at";

fn row_to_channel(row: &libsql::Row) -> Result<Channel, DatabaseError> {
    let id: String = row.get(0).map_err(decode)?;
    let provider = Provider::from(row.get::<String>(2).map_err(decode)?);
    let status: String = row.get(4).map_err(decode)?;
    let settings: String = row.get::<String>(5).unwrap_or_else(|_| "{}".into());
    let secrets: String = row.get::<String>(6).unwrap_or_else(|_| "{}".into());

    Ok(Channel {
        id: parse_uuid(&id)?,
        group_id: row.get(1).map_err(decode)?,
        display_name: row.get(3).map_err(decode)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        settings: ChannelSettings::from_stored(&provider, &settings),
        secrets: ChannelSecrets::from_json(&provider, &secrets),
        provider,
        created_at: parse_datetime(&row.get::<String>(7).map_err(decode)?),
        updated_at: parse_datetime(&row.get::<String>(8).map_err(decode)?),
    })
}

fn row_to_thread(row: &libsql::Row) -> Result<Thread, DatabaseError> {
    let id: String = row.get(0).map_err(decode)?;
    let channel_id: String = row.get(1).map_err(decode)?;

    Ok(Thread {
        id: parse_uuid(&id)?,
        channel_id: parse_uuid(&channel_id)?,
        external_chat_id: row.get(2).map_err(decode)?,
        external_user_id: row.get(3).ok(),
        kind: row.get(4).ok(),
        title: row.get(5).ok(),
        username: row.get(6).ok(),
        first_name: row.get(7).ok(),
        last_name: row.get(8).ok(),
        last_update_id: row.get(9).ok(),
        metadata: parse_json(row.get(10).ok()),
        last_message_text: row.get(11).ok(),
        last_message_at: parse_optional_datetime(row.get(12).ok()),
        last_message_external_id: row.get(13).ok(),
        created_at: parse_datetime(&row.get::<String>(14).map_err(decode)?),
        updated_at: parse_datetime(&row.get::<String>(15).map_err(decode)?),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id: String = row.get(0).map_err(decode)?;
    let thread_id: String = row.get(1).map_err(decode)?;
    let direction: String = row.get(2).map_err(decode)?;
    let delivery_status: Option<String> = row.get(8).ok();

    Ok(Message {
        id: parse_uuid(&id)?,
        thread_id: parse_uuid(&thread_id)?,
        direction: direction.parse().map_err(DatabaseError::Serialization)?,
        external_message_id: row.get(3).ok(),
        external_update_id: row.get(4).ok(),
        sender_external_id: row.get(5).ok(),
        text: row.get(6).ok(),
        payload: parse_json(row.get(7).ok()),
        delivery_status: delivery_status
            .map(|s| s.parse::<DeliveryStatus>())
            .transpose()
            .map_err(DatabaseError::Serialization)?,
        delivery_error: row.get(9).ok(),
        sent_at: parse_optional_datetime(row.get(10).ok()),
        created_by: row.get(11).ok(),
        created_at: parse_datetime(&row.get::<String>(12).map_err(decode)?),
        updated_at: parse_datetime(&row.get::<String>(13).map_err(decode)?),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<DeliveryTask, DatabaseError> {
    let id: String = row.get(0).map_err(decode)?;
    let thread_id: String = row.get(1).map_err(decode)?;
    let message_id: String = row.get(2).map_err(decode)?;
    let status: String = row.get(7).map_err(decode)?;

    Ok(DeliveryTask {
        id: parse_uuid(&id)?,
        thread_id: parse_uuid(&thread_id)?,
        message_id: parse_uuid(&message_id)?,
        local_path: row.get(3).map_err(decode)?,
        original_name: row.get(4).map_err(decode)?,
        caption: row.get(5).ok(),
        mime: row.get(6).ok(),
        status: status.parse::<TaskStatus>().map_err(DatabaseError::Serialization)?,
        attempts: row.get::<i64>(8).map_err(decode)?.max(0) as u32,
        max_attempts: row.get::<i64>(9).map_err(decode)?.max(0) as u32,
        lease_expires_at: parse_optional_datetime(row.get(10).ok()),
        last_error: row.get(11).ok(),
        created_at: parse_datetime(&row.get::<String>(12).map_err(decode)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(self.conn()).await
    }

    // ── Group directory ─────────────────────────────────────────────

    async fn group_role(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> Result<Option<GroupRole>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("group_role: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("group_role: {e}")))?
        {
            Some(row) => {
                let role: String = row.get(0).map_err(decode)?;
                Ok(Some(role.parse().map_err(DatabaseError::Serialization)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_group_member(
        &self,
        group_id: i64,
        user_id: i64,
        role: GroupRole,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO group_members (group_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_id, user_id) DO UPDATE SET role = excluded.role",
                params![group_id, user_id, role.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_group_member: {e}")))?;
        Ok(())
    }

    // ── Channels ────────────────────────────────────────────────────

    async fn create_channel(
        &self,
        group_id: i64,
        provider: &Provider,
        display_name: &str,
    ) -> Result<Channel, DatabaseError> {
        let id = Uuid::new_v4();
        let now = now_ts();
        self.conn()
            .execute(
                "INSERT INTO group_channels (id, group_id, provider, display_name, status, settings, secrets, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'disabled', ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    group_id,
                    provider.as_str(),
                    display_name,
                    ChannelSettings::empty_for(provider).to_json(),
                    ChannelSecrets::empty_for(provider).to_json(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("create_channel", e))?;

        debug!(channel_id = %id, group_id, provider = %provider, "Channel created");
        self.get_channel(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "channel".into(),
            id: id.to_string(),
        })
    }

    async fn get_channel(&self, id: Uuid) -> Result<Option<Channel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHANNEL_COLUMNS} FROM group_channels WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_channel: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_channel: {e}")))?
        {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_channels(&self, group_id: i64) -> Result<Vec<Channel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHANNEL_COLUMNS} FROM group_channels WHERE group_id = ?1 ORDER BY created_at, rowid"
                ),
                params![group_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_channels: {e}")))?;

        let mut channels = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    async fn list_pollable_channels(
        &self,
        provider: &Provider,
    ) -> Result<Vec<Channel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHANNEL_COLUMNS} FROM group_channels
                     WHERE provider = ?1 AND status IN ('active', 'error')
                     ORDER BY created_at, rowid"
                ),
                params![provider.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pollable_channels: {e}")))?;

        let mut channels = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    async fn update_channel(
        &self,
        id: Uuid,
        patch: &ChannelPatch,
    ) -> Result<Option<Channel>, DatabaseError> {
        // NULL parameters leave the column untouched, so a concurrent
        // cursor write is never clobbered by an unrelated patch.
        let settings = patch.settings.as_ref().map(|s| s.to_json());
        let secrets = patch.secrets.as_ref().map(|s| s.to_json());
        let affected = self
            .conn()
            .execute(
                "UPDATE group_channels SET
                    display_name = COALESCE(?1, display_name),
                    status = COALESCE(?2, status),
                    settings = COALESCE(?3, settings),
                    secrets = COALESCE(?4, secrets),
                    updated_at = ?5
                 WHERE id = ?6",
                params![
                    opt_text(patch.display_name.as_deref()),
                    opt_text(patch.status.map(|s| s.as_str())),
                    opt_text(settings.as_deref()),
                    opt_text(secrets.as_deref()),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("update_channel", e))?;

        if affected == 0 {
            return Ok(None);
        }
        self.get_channel(id).await
    }

    async fn mark_channel_error(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE group_channels SET status = 'error', updated_at = ?1
                 WHERE id = ?2 AND status IN ('active', 'error')",
                params![now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_channel_error: {e}")))?;
        Ok(affected > 0)
    }

    async fn restore_channel(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE group_channels SET status = 'active', updated_at = ?1
                 WHERE id = ?2 AND status = 'error'",
                params![now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("restore_channel: {e}")))?;
        Ok(affected > 0)
    }

    async fn save_cursor(&self, id: Uuid, last_update_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE group_channels
                 SET settings = json_set(COALESCE(NULLIF(settings, ''), '{}'), '$.last_update_id', ?1),
                     updated_at = ?2
                 WHERE id = ?3",
                params![last_update_id, now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_cursor: {e}")))?;
        Ok(())
    }

    async fn delete_channel(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM group_channels WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_channel: {e}")))?;
        Ok(affected > 0)
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn upsert_thread(&self, thread: &ThreadUpsert) -> Result<Uuid, DatabaseError> {
        let now = now_ts();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO channel_threads (
                    id, channel_id, external_chat_id, external_user_id, kind, title, username,
                    first_name, last_name, last_update_id, metadata, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                 ON CONFLICT(channel_id, external_chat_id) DO UPDATE SET
                    external_user_id = COALESCE(excluded.external_user_id, channel_threads.external_user_id),
                    kind = COALESCE(excluded.kind, channel_threads.kind),
                    title = excluded.title,
                    username = excluded.username,
                    first_name = excluded.first_name,
                    last_name = excluded.last_name,
                    last_update_id = COALESCE(excluded.last_update_id, channel_threads.last_update_id),
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    Uuid::new_v4().to_string(),
                    thread.channel_id.to_string(),
                    thread.external_chat_id.as_str(),
                    opt_text(thread.external_user_id.as_deref()),
                    opt_text(thread.kind.as_deref()),
                    opt_text(thread.title.as_deref()),
                    opt_text(thread.username.as_deref()),
                    opt_text(thread.first_name.as_deref()),
                    opt_text(thread.last_name.as_deref()),
                    opt_i64(thread.last_update_id),
                    thread.metadata.to_string(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("upsert_thread", e))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_thread: {e}")))?
        {
            Some(row) => parse_uuid(&row.get::<String>(0).map_err(decode)?),
            None => Err(DatabaseError::Query("upsert_thread returned no row".into())),
        }
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM channel_threads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?
        {
            Some(row) => Ok(Some(row_to_thread(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_threads(
        &self,
        channel_id: Uuid,
        query: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Thread>, DatabaseError> {
        let pattern = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{q}%"));
        let filter = "channel_id = ?1 AND (?2 IS NULL
            OR title LIKE ?2 OR username LIKE ?2 OR first_name LIKE ?2
            OR last_name LIKE ?2 OR external_chat_id LIKE ?2)";

        let total = self
            .count(
                &format!("SELECT COUNT(*) FROM channel_threads WHERE {filter}"),
                params![channel_id.to_string(), opt_text(pattern.as_deref())],
            )
            .await?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM channel_threads WHERE {filter}
                     ORDER BY updated_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
                ),
                params![
                    channel_id.to_string(),
                    opt_text(pattern.as_deref()),
                    i64::from(page.per_page),
                    page.offset() as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_threads: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            items.push(row_to_thread(&row)?);
        }
        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn touch_thread(&self, id: Uuid, last: &LastMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE channel_threads SET
                    last_message_text = ?1, last_message_at = ?2,
                    last_message_external_id = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    opt_text(last.text.as_deref()),
                    fmt_ts(&last.at),
                    opt_text(last.external_id.as_deref()),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_thread: {e}")))?;
        Ok(())
    }

    async fn touch_thread_if_newer(
        &self,
        id: Uuid,
        last: &LastMessage,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE channel_threads SET
                    last_message_text = ?1, last_message_at = ?2,
                    last_message_external_id = ?3, updated_at = ?4
                 WHERE id = ?5 AND (last_message_at IS NULL OR last_message_at <= ?2)",
                params![
                    opt_text(last.text.as_deref()),
                    fmt_ts(&last.at),
                    opt_text(last.external_id.as_deref()),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_thread_if_newer: {e}")))?;
        Ok(affected > 0)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn upsert_inbound_message(&self, msg: &InboundMessage) -> Result<Uuid, DatabaseError> {
        let now = now_ts();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO channel_messages (
                    id, thread_id, direction, external_message_id, external_update_id,
                    sender_external_id, text, payload, sent_at, created_at, updated_at
                 ) VALUES (?1, ?2, 'in', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(thread_id, external_message_id, direction) DO UPDATE SET
                    external_update_id = excluded.external_update_id,
                    sender_external_id = excluded.sender_external_id,
                    text = excluded.text,
                    payload = excluded.payload,
                    sent_at = excluded.sent_at,
                    updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    Uuid::new_v4().to_string(),
                    msg.thread_id.to_string(),
                    msg.external_message_id.as_str(),
                    msg.external_update_id,
                    opt_text(msg.sender_external_id.as_deref()),
                    opt_text(msg.text.as_deref()),
                    msg.payload.to_string(),
                    opt_ts(msg.sent_at.as_ref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("upsert_inbound_message", e))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_inbound_message: {e}")))?
        {
            Some(row) => parse_uuid(&row.get::<String>(0).map_err(decode)?),
            None => Err(DatabaseError::Query(
                "upsert_inbound_message returned no row".into(),
            )),
        }
    }

    async fn insert_outbound_message(
        &self,
        msg: &OutboundMessage,
    ) -> Result<Message, DatabaseError> {
        let id = Uuid::new_v4();
        let now = now_ts();
        let status = if msg.queued {
            DeliveryStatus::Queued
        } else {
            DeliveryStatus::Sent
        };
        self.conn()
            .execute(
                "INSERT INTO channel_messages (
                    id, thread_id, direction, external_message_id, text, payload,
                    delivery_status, sent_at, created_by, created_at, updated_at
                 ) VALUES (?1, ?2, 'out', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id.to_string(),
                    msg.thread_id.to_string(),
                    opt_text(msg.external_message_id.as_deref()),
                    opt_text(msg.text.as_deref()),
                    msg.payload.to_string(),
                    status.as_str(),
                    opt_ts(msg.sent_at.as_ref()),
                    opt_i64(msg.created_by),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_outbound_message", e))?;

        self.get_message(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: id.to_string(),
        })
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM channel_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?
        {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_messages(
        &self,
        thread_id: Uuid,
        direction: Option<Direction>,
        page: PageRequest,
    ) -> Result<Page<Message>, DatabaseError> {
        let dir = direction.map(|d| d.as_str());
        let filter = "thread_id = ?1 AND (?2 IS NULL OR direction = ?2)";

        let total = self
            .count(
                &format!("SELECT COUNT(*) FROM channel_messages WHERE {filter}"),
                params![thread_id.to_string(), opt_text(dir)],
            )
            .await?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM channel_messages WHERE {filter}
                     ORDER BY created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
                ),
                params![
                    thread_id.to_string(),
                    opt_text(dir),
                    i64::from(page.per_page),
                    page.offset() as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            items.push(row_to_message(&row)?);
        }
        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn mark_message_sent(
        &self,
        id: Uuid,
        receipt: &DeliveryReceipt,
    ) -> Result<Option<Message>, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE channel_messages SET
                    external_message_id = ?1,
                    payload = ?2,
                    text = COALESCE(?3, text),
                    sent_at = COALESCE(?4, sent_at),
                    delivery_status = 'sent',
                    delivery_error = NULL,
                    updated_at = ?5
                 WHERE id = ?6",
                params![
                    receipt.external_message_id.as_str(),
                    receipt.payload.to_string(),
                    opt_text(receipt.text.as_deref()),
                    opt_ts(receipt.sent_at.as_ref()),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("mark_message_sent", e))?;

        if affected == 0 {
            return Ok(None);
        }
        self.get_message(id).await
    }

    async fn mark_message_failed(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE channel_messages SET delivery_status = 'failed', delivery_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_message_failed: {e}")))?;
        Ok(affected > 0)
    }

    // ── Delivery queue ──────────────────────────────────────────────

    async fn enqueue_delivery(&self, task: &NewDeliveryTask) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = now_ts();
        self.conn()
            .execute(
                "INSERT INTO delivery_tasks (
                    id, thread_id, message_id, local_path, original_name, caption, mime,
                    status, attempts, max_attempts, available_at, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?9, ?9, ?9)",
                params![
                    id.to_string(),
                    task.thread_id.to_string(),
                    task.message_id.to_string(),
                    task.local_path.as_str(),
                    task.original_name.as_str(),
                    opt_text(task.caption.as_deref()),
                    opt_text(task.mime.as_deref()),
                    i64::from(task.max_attempts.max(1)),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("enqueue_delivery", e))?;
        Ok(id)
    }

    async fn claim_delivery(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<DeliveryTask>, DatabaseError> {
        // One statement: selection and lease are atomic, so two consumers
        // never claim the same row.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE delivery_tasks SET
                        status = 'running', attempts = attempts + 1,
                        lease_expires_at = ?2, updated_at = ?1
                     WHERE id = (
                        SELECT id FROM delivery_tasks
                        WHERE (status = 'pending' AND available_at <= ?1)
                           OR (status = 'running' AND lease_expires_at <= ?1 AND attempts < max_attempts)
                        ORDER BY created_at, rowid
                        LIMIT 1
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                params![fmt_ts(&now), fmt_ts(&lease_until)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_delivery: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_delivery: {e}")))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn complete_delivery(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks SET status = 'done', lease_expires_at = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_delivery: {e}")))?;
        Ok(())
    }

    async fn retry_delivery(
        &self,
        id: Uuid,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks SET
                    status = 'pending', last_error = ?1, available_at = ?2,
                    lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?4",
                params![error, fmt_ts(&available_at), now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_delivery: {e}")))?;
        Ok(())
    }

    async fn bury_delivery(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks SET
                    status = 'buried', last_error = ?1, lease_expires_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![error, now_ts(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("bury_delivery: {e}")))?;
        Ok(())
    }

    async fn reap_expired_deliveries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE delivery_tasks SET
                        status = 'buried',
                        last_error = COALESCE(last_error, 'lease expired'),
                        lease_expires_at = NULL,
                        updated_at = ?1
                     WHERE status = 'running' AND lease_expires_at <= ?1 AND attempts >= max_attempts
                     RETURNING {TASK_COLUMNS}"
                ),
                params![fmt_ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reap_expired_deliveries: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<DeliveryTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM delivery_tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_delivery: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_delivery: {e}")))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }
}
