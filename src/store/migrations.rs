//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "channels_threads_messages",
        sql: r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS group_channels (
                id TEXT PRIMARY KEY,
                group_id INTEGER NOT NULL,
                provider TEXT NOT NULL,
                display_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'disabled',
                settings TEXT NOT NULL DEFAULT '{}',
                secrets TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (group_id, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_group_channels_provider_status
                ON group_channels(provider, status);

            CREATE TABLE IF NOT EXISTS channel_threads (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL REFERENCES group_channels(id) ON DELETE CASCADE,
                external_chat_id TEXT NOT NULL,
                external_user_id TEXT,
                kind TEXT,
                title TEXT,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                last_update_id INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}',
                last_message_text TEXT,
                last_message_at TEXT,
                last_message_external_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (channel_id, external_chat_id)
            );
            CREATE INDEX IF NOT EXISTS idx_channel_threads_updated
                ON channel_threads(channel_id, updated_at);

            CREATE TABLE IF NOT EXISTS channel_messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES channel_threads(id) ON DELETE CASCADE,
                direction TEXT NOT NULL,
                external_message_id TEXT,
                external_update_id INTEGER,
                sender_external_id TEXT,
                text TEXT,
                payload TEXT NOT NULL DEFAULT '{}',
                delivery_status TEXT,
                delivery_error TEXT,
                sent_at TEXT,
                created_by INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_channel_messages_external
                ON channel_messages(thread_id, external_message_id, direction);
            CREATE INDEX IF NOT EXISTS idx_channel_messages_thread_created
                ON channel_messages(thread_id, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "delivery_tasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS delivery_tasks (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                local_path TEXT NOT NULL,
                original_name TEXT NOT NULL,
                caption TEXT,
                mime TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 2,
                available_at TEXT NOT NULL,
                lease_expires_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_tasks_ready
                ON delivery_tasks(status, available_at);
        "#,
    },
];

/// Enable foreign keys and apply pending migrations.
pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    // Cascading deletes depend on this; it is per-connection in SQLite.
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to enable foreign keys: {e}")))?;
    run_migrations(conn).await
}

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
