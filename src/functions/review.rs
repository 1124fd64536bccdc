use crate::functions::publish::Publisher;
use crate::schema::{Post, PostStatus};
use crate::services::alert::AlertThrottle;
use crate::services::telegram::Messenger;
use crate::store::posts::StatusUpdate;
use crate::store::{audit, now_ts, posts, routing};
use crate::text::{SUMMARY_MAX_LENGTH, truncate_chars};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("post not found")]
    NotFound,
    #[error("post was already handled")]
    AlreadyHandled,
    #[error("post is still being delivered to editors")]
    StillDelivering,
    #[error("no target channel is configured")]
    NoTargetChannel,
    #[error("publication failed: {0}")]
    PublishFailed(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Editor-facing review operations. Every status change goes through the
/// conditional transition in the store, so concurrent editors acting on the
/// same post resolve to exactly one winner.
pub struct Review {
    publisher: Arc<Publisher>,
    messenger: Arc<dyn Messenger>,
    alerts: Arc<AlertThrottle>,
    fallback_channel: Option<String>,
}

impl Review {
    pub fn new(
        publisher: Arc<Publisher>,
        messenger: Arc<dyn Messenger>,
        alerts: Arc<AlertThrottle>,
        fallback_channel: Option<String>,
    ) -> Self {
        Self {
            publisher,
            messenger,
            alerts,
            fallback_channel,
        }
    }

    /// Approve a post: resolve channels, claim it, publish, mark published.
    /// On publish failure the post returns to `pending_review` so the editor
    /// can retry. Returns the channels actually published to.
    pub async fn approve(
        &self,
        db: &SqlitePool,
        post_id: i64,
        actor: &str,
    ) -> Result<Vec<String>, ReviewError> {
        let post = require_post(db, post_id).await?;

        let channels = routing::get_channels_for_publish(
            db,
            &post.routing_text(),
            self.fallback_channel.as_deref(),
        )
        .await?;
        if channels.is_empty() {
            return Err(ReviewError::NoTargetChannel);
        }

        let claimed = posts::transition(
            db,
            post_id,
            &[PostStatus::PendingReview, PostStatus::Scheduled],
            PostStatus::Publishing,
            StatusUpdate::default(),
        )
        .await?;
        if !claimed {
            return Err(claim_refusal(db, post_id).await?);
        }

        match self.publisher.publish(&post, &channels).await {
            Ok(()) => {
                posts::transition(
                    db,
                    post_id,
                    &[PostStatus::Publishing],
                    PostStatus::Published,
                    StatusUpdate {
                        scheduled_at: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
                audit::add_audit_log(
                    db,
                    Some(post_id),
                    "approved",
                    Some(actor),
                    Some(serde_json::json!({ "channels": channels })),
                )
                .await?;
                tracing::info!(post_id, actor, channels = channels.len(), "post approved and published");
                Ok(channels)
            }
            Err(e) => {
                posts::transition(
                    db,
                    post_id,
                    &[PostStatus::Publishing],
                    PostStatus::PendingReview,
                    StatusUpdate::default(),
                )
                .await?;
                audit::add_audit_log(
                    db,
                    Some(post_id),
                    "publish_failed",
                    Some(actor),
                    Some(serde_json::json!({ "error": e.to_string() })),
                )
                .await?;
                tracing::error!(post_id, error = %e, "publication failed, post returned to review");
                self.alerts
                    .alert(
                        self.messenger.as_ref(),
                        &format!("publish_failed:{post_id}"),
                        &format!("Publication of post {post_id} failed: {e}"),
                    )
                    .await;
                Err(ReviewError::PublishFailed(e.to_string()))
            }
        }
    }

    pub async fn reject(
        &self,
        db: &SqlitePool,
        post_id: i64,
        actor: &str,
    ) -> Result<(), ReviewError> {
        require_post(db, post_id).await?;
        let changed = posts::transition(
            db,
            post_id,
            &[PostStatus::PendingReview, PostStatus::Scheduled],
            PostStatus::Rejected,
            StatusUpdate {
                scheduled_at: Some(None),
                ..Default::default()
            },
        )
        .await?;
        if !changed {
            return Err(claim_refusal(db, post_id).await?);
        }
        audit::add_audit_log(db, Some(post_id), "rejected", Some(actor), None).await?;
        tracing::info!(post_id, actor, "post rejected");
        Ok(())
    }

    /// Replace the summary shown to editors and published to channels. The
    /// generated summary stays untouched underneath.
    pub async fn edit_summary(
        &self,
        db: &SqlitePool,
        post_id: i64,
        actor: &str,
        new_summary: &str,
    ) -> Result<(), ReviewError> {
        let new_summary = new_summary.trim();
        if new_summary.is_empty() {
            return Err(ReviewError::Validation(
                "replacement summary must not be empty".into(),
            ));
        }
        let post = require_post(db, post_id).await?;
        let status = current_status(&post)?;
        if !matches!(status, PostStatus::PendingReview | PostStatus::Scheduled) {
            return Err(claim_refusal(db, post_id).await?);
        }

        let truncated = truncate_chars(new_summary, SUMMARY_MAX_LENGTH);
        let changed = posts::transition(
            db,
            post_id,
            &[status],
            status,
            StatusUpdate {
                edited_summary: Some(truncated),
                ..Default::default()
            },
        )
        .await?;
        if !changed {
            return Err(claim_refusal(db, post_id).await?);
        }
        audit::add_audit_log(
            db,
            Some(post_id),
            "edited",
            Some(actor),
            Some(serde_json::json!({ "length": new_summary.chars().count() })),
        )
        .await?;
        Ok(())
    }

    pub async fn schedule(
        &self,
        db: &SqlitePool,
        post_id: i64,
        actor: &str,
        publish_at: i64,
    ) -> Result<(), ReviewError> {
        if publish_at <= now_ts() {
            return Err(ReviewError::Validation(
                "scheduled time must be in the future".into(),
            ));
        }
        require_post(db, post_id).await?;
        let changed = posts::transition(
            db,
            post_id,
            &[PostStatus::PendingReview, PostStatus::Scheduled],
            PostStatus::Scheduled,
            StatusUpdate {
                scheduled_at: Some(Some(publish_at)),
                ..Default::default()
            },
        )
        .await?;
        if !changed {
            return Err(claim_refusal(db, post_id).await?);
        }
        audit::add_audit_log(
            db,
            Some(post_id),
            "scheduled",
            Some(actor),
            Some(serde_json::json!({ "publish_at": publish_at })),
        )
        .await?;
        tracing::info!(post_id, actor, publish_at, "post scheduled");
        Ok(())
    }

    pub async fn cancel_schedule(
        &self,
        db: &SqlitePool,
        post_id: i64,
        actor: &str,
    ) -> Result<(), ReviewError> {
        require_post(db, post_id).await?;
        let changed = posts::transition(
            db,
            post_id,
            &[PostStatus::Scheduled],
            PostStatus::PendingReview,
            StatusUpdate {
                scheduled_at: Some(None),
                ..Default::default()
            },
        )
        .await?;
        if !changed {
            return Err(claim_refusal(db, post_id).await?);
        }
        audit::add_audit_log(db, Some(post_id), "schedule_cancelled", Some(actor), None).await?;
        Ok(())
    }
}

async fn require_post(db: &SqlitePool, post_id: i64) -> Result<Post, ReviewError> {
    posts::get_post(db, post_id)
        .await?
        .ok_or(ReviewError::NotFound)
}

fn current_status(post: &Post) -> Result<PostStatus, ReviewError> {
    post.status()
        .map_err(|e| ReviewError::Internal(anyhow::Error::new(e)))
}

/// Explain why a conditional transition did not fire, based on where the
/// post actually is now.
async fn claim_refusal(db: &SqlitePool, post_id: i64) -> Result<ReviewError, ReviewError> {
    let post = require_post(db, post_id).await?;
    Ok(match current_status(&post)? {
        PostStatus::Processing | PostStatus::SendFailed => ReviewError::StillDelivering,
        _ => ReviewError::AlreadyHandled,
    })
}
