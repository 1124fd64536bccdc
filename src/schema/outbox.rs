use serde::{Deserialize, Serialize};

/// One detected source-channel message awaiting handoff to the downstream
/// processor. Unique per (channel_id, message_id); once sent the row is
/// terminal and never re-dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: i64,
    pub channel_id: String,
    pub message_id: i64,
    pub pdf_path: String,
    pub pdf_missing: bool,
    pub post_text: String,
    pub source_channel: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}
