use crate::functions::delivery::DeliveryPipeline;
use crate::functions::publish::Publisher;
use crate::schema::{Post, PostStatus};
use crate::services::alert::AlertThrottle;
use crate::services::telegram::Messenger;
use crate::store::posts::StatusUpdate;
use crate::store::{audit, posts, routing};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const DELIVERY_RETRY_BATCH: i64 = 25;

/// Background reconciler: repairs stuck states, drives delivery retries, and
/// publishes posts whose scheduled time has arrived.
pub struct Scheduler {
    pipeline: Arc<DeliveryPipeline>,
    publisher: Arc<Publisher>,
    messenger: Arc<dyn Messenger>,
    alerts: Arc<AlertThrottle>,
    fallback_channel: Option<String>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<DeliveryPipeline>,
        publisher: Arc<Publisher>,
        messenger: Arc<dyn Messenger>,
        alerts: Arc<AlertThrottle>,
        fallback_channel: Option<String>,
    ) -> Self {
        Self {
            pipeline,
            publisher,
            messenger,
            alerts,
            fallback_channel,
        }
    }

    /// One reconciliation round. Returns how many posts were acted on.
    pub async fn tick(&self, db: &SqlitePool) -> anyhow::Result<u32> {
        let mut acted = 0u32;

        let stuck = posts::reset_stuck_publishing(db).await?;
        if stuck > 0 {
            tracing::warn!(count = stuck, "returned stuck publishing posts to review");
            acted += stuck as u32;
        }

        let cooled = posts::reset_send_failed_for_retry(db).await?;
        if cooled > 0 {
            tracing::info!(count = cooled, "reset cooled-down send_failed posts for retry");
            acted += cooled as u32;
        }

        for post in posts::get_posts_for_delivery_retry(db, DELIVERY_RETRY_BATCH).await? {
            if let Err(e) = self.pipeline.deliver(db, post.id).await {
                tracing::warn!(post_id = post.id, error = %e, "delivery retry round failed");
            }
            acted += 1;
        }

        for post in posts::get_scheduled_posts_due(db).await? {
            if self.publish_due(db, &post).await? {
                acted += 1;
            }
        }

        Ok(acted)
    }

    /// Publish one due scheduled post. Claims it first so a concurrent
    /// manual approval and the scheduler cannot both publish; on failure the
    /// post goes back to `scheduled` with its time intact and will be
    /// retried next round.
    async fn publish_due(&self, db: &SqlitePool, post: &Post) -> anyhow::Result<bool> {
        let channels = routing::get_channels_for_publish(
            db,
            &post.routing_text(),
            self.fallback_channel.as_deref(),
        )
        .await?;
        if channels.is_empty() {
            tracing::warn!(post_id = post.id, "scheduled post has no target channels, leaving scheduled");
            return Ok(false);
        }

        let claimed = posts::transition(
            db,
            post.id,
            &[PostStatus::Scheduled],
            PostStatus::Publishing,
            StatusUpdate::default(),
        )
        .await?;
        if !claimed {
            tracing::debug!(post_id = post.id, "scheduled post claimed elsewhere, skipping");
            return Ok(false);
        }

        match self.publisher.publish(post, &channels).await {
            Ok(()) => {
                posts::transition(
                    db,
                    post.id,
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
                    Some(post.id),
                    "scheduled_published",
                    Some("scheduler"),
                    Some(serde_json::json!({ "channels": channels })),
                )
                .await?;
                tracing::info!(post_id = post.id, channels = channels.len(), "scheduled post published");
            }
            Err(e) => {
                posts::transition(
                    db,
                    post.id,
                    &[PostStatus::Publishing],
                    PostStatus::Scheduled,
                    StatusUpdate::default(),
                )
                .await?;
                audit::add_audit_log(
                    db,
                    Some(post.id),
                    "scheduled_publish_failed",
                    Some("scheduler"),
                    Some(serde_json::json!({ "error": e.to_string() })),
                )
                .await?;
                tracing::error!(post_id = post.id, error = %e, "scheduled publication failed");
                self.alerts
                    .alert(
                        self.messenger.as_ref(),
                        &format!("scheduled_publish_failed:{}", post.id),
                        &format!("Scheduled publication of post {} failed: {e}", post.id),
                    )
                    .await;
            }
        }
        Ok(true)
    }

    pub async fn run(&self, db: SqlitePool, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("scheduler started");
        loop {
            if let Err(e) = self.tick(&db).await {
                tracing::warn!(error = %e, "scheduler tick failed");
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        tracing::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fake::FakeMessenger;
    use crate::services::telegram::SendError;
    use crate::store::posts::NewPost;
    use crate::store::routing::seed;
    use crate::store::{now_ts, test_pool};
    use std::path::PathBuf;

    fn scheduler(messenger: Arc<FakeMessenger>) -> Scheduler {
        let alerts = Arc::new(AlertThrottle::new(None));
        let publisher = Arc::new(Publisher::new(
            messenger.clone(),
            None,
            PathBuf::from("/var/lib/redaktor/pdfs"),
        ));
        let pipeline = Arc::new(DeliveryPipeline::new(messenger.clone(), alerts.clone()));
        Scheduler::new(pipeline, publisher, messenger, alerts, None)
    }

    async fn post_scheduled_at(pool: &SqlitePool, at: i64) -> i64 {
        let id = posts::create_post(
            pool,
            NewPost {
                source_channel: "-100111".into(),
                source_message_id: 1,
                summary: Some("scheduled summary".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        sqlx::query("UPDATE posts SET status = 'scheduled', scheduled_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn due_scheduled_post_is_published() {
        let pool = test_pool().await;
        seed::add_target_channel(&pool, "@main", true).await;
        let due = post_scheduled_at(&pool, now_ts() - 5).await;
        let future = post_scheduled_at(&pool, now_ts() + 3600).await;

        let messenger = Arc::new(FakeMessenger::new());
        scheduler(messenger.clone()).tick(&pool).await.unwrap();

        let due = posts::get_post(&pool, due).await.unwrap().unwrap();
        assert_eq!(due.status().unwrap(), PostStatus::Published);
        assert!(due.scheduled_at.is_none());
        assert_eq!(messenger.sent_to("@main").len(), 1);
        assert_eq!(audit::count_audit(&pool, "scheduled_published").await, 1);

        let future = posts::get_post(&pool, future).await.unwrap().unwrap();
        assert_eq!(future.status().unwrap(), PostStatus::Scheduled);
    }

    #[tokio::test]
    async fn failed_scheduled_publication_stays_scheduled() {
        let pool = test_pool().await;
        seed::add_target_channel(&pool, "@main", true).await;
        let at = now_ts() - 5;
        let id = post_scheduled_at(&pool, at).await;

        let messenger = Arc::new(FakeMessenger::new());
        messenger.fail_next("@main", SendError::Timeout);
        messenger.fail_next("@main", SendError::Timeout);
        scheduler(messenger).tick(&pool).await.unwrap();

        let post = posts::get_post(&pool, id).await.unwrap().unwrap();
        assert_eq!(post.status().unwrap(), PostStatus::Scheduled);
        assert_eq!(post.scheduled_at, Some(at));
        assert_eq!(audit::count_audit(&pool, "scheduled_publish_failed").await, 1);
    }

    #[tokio::test]
    async fn scheduled_post_without_channels_is_left_alone() {
        let pool = test_pool().await;
        let id = post_scheduled_at(&pool, now_ts() - 5).await;

        let messenger = Arc::new(FakeMessenger::new());
        scheduler(messenger.clone()).tick(&pool).await.unwrap();

        let post = posts::get_post(&pool, id).await.unwrap().unwrap();
        assert_eq!(post.status().unwrap(), PostStatus::Scheduled);
        assert!(messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn tick_repairs_stuck_publishing_posts() {
        let pool = test_pool().await;
        let id = posts::create_post(
            &pool,
            NewPost {
                source_channel: "-100111".into(),
                source_message_id: 2,
                summary: Some("s".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        sqlx::query("UPDATE posts SET status = 'publishing', updated_at = ? WHERE id = ?")
            .bind(now_ts() - 11 * 60)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();

        let messenger = Arc::new(FakeMessenger::new());
        scheduler(messenger).tick(&pool).await.unwrap();

        let post = posts::get_post(&pool, id).await.unwrap().unwrap();
        assert_eq!(post.status().unwrap(), PostStatus::PendingReview);
    }

    #[tokio::test]
    async fn tick_retries_undelivered_posts() {
        let pool = test_pool().await;
        seed::add_editor(&pool, 501).await;
        let id = posts::create_post(
            &pool,
            NewPost {
                source_channel: "-100111".into(),
                source_message_id: 3,
                summary: Some("retry me".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let messenger = Arc::new(FakeMessenger::new());
        scheduler(messenger.clone()).tick(&pool).await.unwrap();

        let post = posts::get_post(&pool, id).await.unwrap().unwrap();
        assert_eq!(post.status().unwrap(), PostStatus::PendingReview);
        assert_eq!(messenger.sent_to("501").len(), 1);
    }
}
