use crate::schema::{Post, PostStatus};
use crate::store::backoff::RETRY_POLICY;
use crate::store::now_ts;
use crate::text::truncate_chars;
use sqlx::SqlitePool;
use std::collections::HashMap;

/// How long a post may sit in `publishing` before the reconciler assumes the
/// claimant crashed and returns it to `pending_review`.
pub const PUBLISHING_STUCK_THRESHOLD_SECS: i64 = 600;
/// Cool-down after which a `send_failed` post gets its delivery bookkeeping
/// reset for another round of retries.
pub const SEND_FAILED_RETRY_AFTER_SECS: i64 = 3600;

const MAX_ERROR_LEN: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub source_channel: String,
    pub source_message_id: i64,
    pub original_text: Option<String>,
    pub pdf_path: String,
    pub summary: Option<String>,
}

/// Insert a new post in `processing`. This is the only unconditional status
/// write in the store.
pub async fn create_post(pool: &SqlitePool, post: NewPost) -> anyhow::Result<i64> {
    let now = now_ts();
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO posts
            (source_channel, source_message_id, original_text, pdf_path, summary,
             status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'processing', ?, ?)
        RETURNING id
        "#,
    )
    .bind(&post.source_channel)
    .bind(post.source_message_id)
    .bind(&post.original_text)
    .bind(&post.pdf_path)
    .bind(&post.summary)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_post(pool: &SqlitePool, post_id: i64) -> anyhow::Result<Option<Post>> {
    let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    Ok(post)
}

/// Optional field changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub edited_summary: Option<String>,
    pub editor_message_id: Option<i64>,
    /// `Some(Some(ts))` sets scheduled_at, `Some(None)` clears it.
    pub scheduled_at: Option<Option<i64>>,
}

/// Conditional compare-and-swap on status: the row is updated only if its
/// current status is in `expected`. Returns whether a row changed. This is
/// the single mechanism preventing double-processing races; no component may
/// read a status, decide, and write back unconditionally.
pub async fn transition(
    pool: &SqlitePool,
    post_id: i64,
    expected: &[PostStatus],
    new_status: PostStatus,
    update: StatusUpdate,
) -> anyhow::Result<bool> {
    let mut sql = String::from("UPDATE posts SET status = ?, updated_at = ?");
    if update.edited_summary.is_some() {
        sql.push_str(", edited_summary = ?");
    }
    if update.editor_message_id.is_some() {
        sql.push_str(", editor_message_id = ?");
    }
    if update.scheduled_at.is_some() {
        sql.push_str(", scheduled_at = ?");
    }
    let expected_list = expected
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&format!(" WHERE id = ? AND status IN ({expected_list})"));

    let mut query = sqlx::query(&sql).bind(new_status.as_str()).bind(now_ts());
    if let Some(summary) = &update.edited_summary {
        query = query.bind(summary);
    }
    if let Some(message_id) = update.editor_message_id {
        query = query.bind(message_id);
    }
    if let Some(scheduled_at) = update.scheduled_at {
        query = query.bind(scheduled_at);
    }
    let result = query.bind(post_id).execute(pool).await?;
    Ok(result.rows_affected() == 1)
}

/// Atomically claim a pending post for publication. Exactly one of two
/// concurrent claimants wins; the loser sees `false` and the post unchanged.
pub async fn claim_for_publish(pool: &SqlitePool, post_id: i64) -> anyhow::Result<bool> {
    transition(
        pool,
        post_id,
        &[PostStatus::PendingReview],
        PostStatus::Publishing,
        StatusUpdate::default(),
    )
    .await
}

/// Record one failed delivery-to-editors round. Applies the shared backoff
/// policy; at the ceiling the post goes `send_failed` with no retry time.
/// One UPDATE, so concurrent rounds each count: the increment and the
/// ceiling check read the stored attempt count, never a stale one.
pub async fn record_delivery_failure(
    pool: &SqlitePool,
    post_id: i64,
    error: &str,
) -> anyhow::Result<()> {
    let error = truncate_chars(error, MAX_ERROR_LEN);
    let now = now_ts();
    sqlx::query(
        r#"
        UPDATE posts
        SET delivery_attempts = delivery_attempts + 1,
            last_delivery_error = ?,
            status = CASE WHEN delivery_attempts + 1 >= ? THEN 'send_failed' ELSE status END,
            next_retry_at = CASE WHEN delivery_attempts + 1 >= ? THEN NULL
                                 ELSE ? + (? << delivery_attempts) END,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&error)
    .bind(RETRY_POLICY.max_attempts)
    .bind(RETRY_POLICY.max_attempts)
    .bind(now)
    .bind(RETRY_POLICY.base_delay_secs)
    .bind(now)
    .bind(post_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist the summary and original text supplied by the processor callback.
pub async fn update_post_content(
    pool: &SqlitePool,
    post_id: i64,
    summary: Option<&str>,
    original_text: Option<&str>,
    pdf_path: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE posts
        SET summary = COALESCE(?, summary),
            original_text = COALESCE(?, original_text),
            pdf_path = COALESCE(?, pdf_path),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(summary)
    .bind(original_text)
    .bind(pdf_path)
    .bind(now_ts())
    .bind(post_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn counts_by_status(pool: &SqlitePool) -> anyhow::Result<HashMap<PostStatus, i64>> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM posts GROUP BY status",
    )
    .fetch_all(pool)
    .await?;
    let mut counts = HashMap::new();
    for (status, count) in rows {
        counts.insert(status.parse::<PostStatus>()?, count);
    }
    Ok(counts)
}

pub async fn get_scheduled_posts_due(pool: &SqlitePool) -> anyhow::Result<Vec<Post>> {
    let posts = sqlx::query_as::<_, Post>(
        r#"
        SELECT * FROM posts
        WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
        ORDER BY scheduled_at
        "#,
    )
    .bind(now_ts())
    .fetch_all(pool)
    .await?;
    Ok(posts)
}

/// Posts eligible for another delivery-to-editors round: still undelivered,
/// due per next_retry_at, below the attempt ceiling.
pub async fn get_posts_for_delivery_retry(
    pool: &SqlitePool,
    limit: i64,
) -> anyhow::Result<Vec<Post>> {
    let posts = sqlx::query_as::<_, Post>(
        r#"
        SELECT * FROM posts
        WHERE status IN ('processing', 'send_failed')
          AND editor_message_id IS NULL
          AND (next_retry_at IS NULL OR next_retry_at <= ?)
          AND delivery_attempts < ?
        ORDER BY next_retry_at IS NOT NULL, next_retry_at, id
        LIMIT ?
        "#,
    )
    .bind(now_ts())
    .bind(RETRY_POLICY.max_attempts)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(posts)
}

/// Posts wedged in `publishing` past the threshold go back to
/// `pending_review` so a human (or the scheduler) can retry. Protects
/// against a crash between claim and completion.
pub async fn reset_stuck_publishing(pool: &SqlitePool) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE posts SET status = 'pending_review', updated_at = ?
        WHERE status = 'publishing' AND updated_at < ?
        "#,
    )
    .bind(now_ts())
    .bind(now_ts() - PUBLISHING_STUCK_THRESHOLD_SECS)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// After the cool-down, give exhausted posts a fresh round of delivery
/// retries. Bounded cycles, not infinite immediate retries.
pub async fn reset_send_failed_for_retry(pool: &SqlitePool) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE posts
        SET delivery_attempts = 0, last_delivery_error = NULL, next_retry_at = ?,
            updated_at = ?
        WHERE status = 'send_failed' AND updated_at < ?
        "#,
    )
    .bind(now_ts())
    .bind(now_ts())
    .bind(now_ts() - SEND_FAILED_RETRY_AFTER_SECS)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
