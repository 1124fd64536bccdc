use crate::schema::OutboxEntry;
use crate::store::backoff::RETRY_POLICY;
use crate::store::now_ts;
use crate::text::truncate_chars;
use sqlx::SqlitePool;

const MAX_ERROR_LEN: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct NewOutboxEntry {
    pub channel_id: String,
    pub message_id: i64,
    pub pdf_path: String,
    pub pdf_missing: bool,
    pub post_text: String,
    pub source_channel: String,
}

/// Insert a detected source post. Returns the new id, or `None` when an entry
/// for the same (channel, message) already exists — re-detection is a silent
/// no-op for the caller, not an error.
pub async fn insert_outbox(
    pool: &SqlitePool,
    entry: NewOutboxEntry,
) -> anyhow::Result<Option<i64>> {
    let now = now_ts();
    let source_channel = if entry.source_channel.is_empty() {
        entry.channel_id.clone()
    } else {
        entry.source_channel
    };
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO outbox
            (channel_id, message_id, pdf_path, pdf_missing, post_text, source_channel,
             status, attempts, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
        ON CONFLICT (channel_id, message_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&entry.channel_id)
    .bind(entry.message_id)
    .bind(&entry.pdf_path)
    .bind(entry.pdf_missing)
    .bind(&entry.post_text)
    .bind(&source_channel)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Pending entries eligible for dispatch, oldest first.
pub async fn get_pending_batch(pool: &SqlitePool, limit: i64) -> anyhow::Result<Vec<OutboxEntry>> {
    let entries = sqlx::query_as::<_, OutboxEntry>(
        r#"
        SELECT * FROM outbox
        WHERE status = 'pending'
          AND attempts < ?
          AND (next_retry_at IS NULL OR next_retry_at <= ?)
        ORDER BY created_at
        LIMIT ?
        "#,
    )
    .bind(RETRY_POLICY.max_attempts)
    .bind(now_ts())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

/// Terminal success; the row is never dispatched again.
pub async fn mark_sent(pool: &SqlitePool, outbox_id: i64) -> anyhow::Result<()> {
    sqlx::query("UPDATE outbox SET status = 'sent', updated_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(outbox_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a failed handoff attempt under the shared backoff policy; at the
/// ceiling the entry goes terminal `failed`.
pub async fn mark_failed(
    pool: &SqlitePool,
    outbox_id: i64,
    error: &str,
    attempts: i64,
) -> anyhow::Result<()> {
    match RETRY_POLICY.backoff_after(attempts) {
        Some(delay_secs) => {
            sqlx::query(
                r#"
                UPDATE outbox
                SET last_error = ?, attempts = ?, next_retry_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(truncate_chars(error, MAX_ERROR_LEN))
            .bind(attempts)
            .bind(now_ts() + delay_secs)
            .bind(now_ts())
            .bind(outbox_id)
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                UPDATE outbox
                SET status = 'failed', last_error = ?, attempts = ?, next_retry_at = NULL,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(truncate_chars(error, MAX_ERROR_LEN))
            .bind(attempts)
            .bind(now_ts())
            .bind(outbox_id)
            .execute(pool)
            .await?;
            tracing::warn!(outbox_id, attempts, "outbox entry exhausted retries, marked failed");
        }
    }
    Ok(())
}

/// Downstream rejected the payload outright (non-timeout 4xx); the backoff
/// path is skipped and the entry goes terminal immediately.
pub async fn mark_failed_terminal(
    pool: &SqlitePool,
    outbox_id: i64,
    error: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE outbox
        SET status = 'failed', last_error = ?, next_retry_at = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(truncate_chars(error, MAX_ERROR_LEN))
    .bind(now_ts())
    .bind(outbox_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;

    fn entry(message_id: i64) -> NewOutboxEntry {
        NewOutboxEntry {
            channel_id: "-100111".into(),
            message_id,
            pdf_path: "/data/pdfs/a.pdf".into(),
            pdf_missing: false,
            post_text: "Report".into(),
            source_channel: "reports".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_silent_no_op() {
        let pool = test_pool().await;
        let first = insert_outbox(&pool, entry(42)).await.unwrap();
        assert!(first.is_some());

        let second = insert_outbox(&pool, entry(42)).await.unwrap();
        assert!(second.is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn empty_source_channel_falls_back_to_channel_id() {
        let pool = test_pool().await;
        let mut new_entry = entry(1);
        new_entry.source_channel = String::new();
        insert_outbox(&pool, new_entry).await.unwrap();

        let source: String = sqlx::query_scalar("SELECT source_channel FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(source, "-100111");
    }

    #[tokio::test]
    async fn pending_batch_is_oldest_first_and_skips_ineligible() {
        let pool = test_pool().await;
        let old = insert_outbox(&pool, entry(1)).await.unwrap().unwrap();
        let young = insert_outbox(&pool, entry(2)).await.unwrap().unwrap();
        let delayed = insert_outbox(&pool, entry(3)).await.unwrap().unwrap();
        let sent = insert_outbox(&pool, entry(4)).await.unwrap().unwrap();

        sqlx::query("UPDATE outbox SET created_at = created_at - 100 WHERE id = ?")
            .bind(old)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE outbox SET next_retry_at = ? WHERE id = ?")
            .bind(now_ts() + 600)
            .bind(delayed)
            .execute(&pool)
            .await
            .unwrap();
        mark_sent(&pool, sent).await.unwrap();

        let batch = get_pending_batch(&pool, 10).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![old, young]);
    }

    #[tokio::test]
    async fn failures_back_off_then_go_terminal() {
        let pool = test_pool().await;
        let id = insert_outbox(&pool, entry(1)).await.unwrap().unwrap();

        mark_failed(&pool, id, "connection refused", 1).await.unwrap();
        let row = sqlx::query_as::<_, crate::schema::OutboxEntry>("SELECT * FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.attempts, 1);
        let delay = row.next_retry_at.unwrap() - now_ts();
        assert!((delay - 60).abs() <= 2);

        mark_failed(&pool, id, "connection refused", 5).await.unwrap();
        let row = sqlx::query_as::<_, crate::schema::OutboxEntry>("SELECT * FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn terminal_rejection_skips_backoff() {
        let pool = test_pool().await;
        let id = insert_outbox(&pool, entry(1)).await.unwrap().unwrap();

        mark_failed_terminal(&pool, id, "422 unprocessable").await.unwrap();
        let status: String = sqlx::query_scalar("SELECT status FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "failed");

        let batch = get_pending_batch(&pool, 10).await.unwrap();
        assert!(batch.is_empty());
    }
}
