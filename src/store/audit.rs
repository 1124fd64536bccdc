use crate::store::now_ts;
use sqlx::SqlitePool;

/// Append one audit row. Failures here must never break the calling
/// workflow; the caller decides whether to `?` or log-and-continue.
pub async fn add_audit_log(
    pool: &SqlitePool,
    post_id: Option<i64>,
    action: &str,
    actor: Option<&str>,
    details: Option<serde_json::Value>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO audit_log (post_id, action, actor, details, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(post_id)
    .bind(action)
    .bind(actor)
    .bind(details.map(|d| d.to_string()))
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
pub async fn count_audit(pool: &SqlitePool, action: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE action = ?")
        .bind(action)
        .fetch_one(pool)
        .await
        .unwrap()
}
