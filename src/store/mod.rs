pub mod audit;
pub mod backoff;
pub mod outbox;
pub mod posts;
pub mod routing;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

/// All tables are created idempotently at startup; there is no separate
/// migration step for this deployment.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_channel TEXT NOT NULL,
    source_message_id INTEGER NOT NULL,
    original_text TEXT,
    pdf_path TEXT NOT NULL DEFAULT '',
    summary TEXT,
    edited_summary TEXT,
    editor_message_id INTEGER,
    status TEXT NOT NULL DEFAULT 'processing',
    scheduled_at INTEGER,
    delivery_attempts INTEGER NOT NULL DEFAULT 0,
    last_delivery_error TEXT,
    next_retry_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    pdf_path TEXT NOT NULL DEFAULT '',
    pdf_missing INTEGER NOT NULL DEFAULT 0,
    post_text TEXT NOT NULL DEFAULT '',
    source_channel TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_retry_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (channel_id, message_id)
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER,
    action TEXT NOT NULL,
    actor TEXT,
    details TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS editors (
    user_id INTEGER PRIMARY KEY,
    username TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS target_channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_identifier TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS keyword_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    target_channel_id INTEGER NOT NULL REFERENCES target_channels(id),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS keywords (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    word TEXT NOT NULL UNIQUE,
    group_id INTEGER REFERENCES keyword_groups(id),
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub async fn connect(database_path: &str) -> anyhow::Result<SqlitePool> {
    let options =
        SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

/// Current time as unix epoch seconds. All persisted timestamps use this.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    // Single connection so every query in a test sees the same in-memory db.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}
