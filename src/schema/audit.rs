use serde::{Deserialize, Serialize};

/// Append-only audit trail row. Written on every meaningful transition,
/// never read back by the core logic.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub post_id: Option<i64>,
    pub action: String,
    pub actor: Option<String>,
    pub details: Option<String>,
    pub created_at: i64,
}
