use crate::schema::PostStatus;
use crate::services::alert::AlertThrottle;
use crate::services::telegram::{Messenger, SendError, send_with_retry};
use crate::store::{audit, posts, routing};
use crate::store::posts::StatusUpdate;
use crate::text::{CHUNK_LIMIT, split_text};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Delivers finished posts to the editor roster. One pipeline instance is
/// shared by the webhook handler and the scheduler so the single-flight
/// guard covers both entry points.
pub struct DeliveryPipeline {
    messenger: Arc<dyn Messenger>,
    alerts: Arc<AlertThrottle>,
    in_flight: Mutex<HashSet<i64>>,
    // Serializes the first-recipient phase so two rounds for the same post
    // cannot both conclude "nobody has it yet" and double-send.
    first_send_lock: tokio::sync::Mutex<()>,
}

struct SendingGuard<'a> {
    set: &'a Mutex<HashSet<i64>>,
    post_id: i64,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.post_id);
    }
}

impl DeliveryPipeline {
    pub fn new(messenger: Arc<dyn Messenger>, alerts: Arc<AlertThrottle>) -> Self {
        Self {
            messenger,
            alerts,
            in_flight: Mutex::new(HashSet::new()),
            first_send_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn try_begin(&self, post_id: i64) -> Option<SendingGuard<'_>> {
        if self.in_flight.lock().unwrap().insert(post_id) {
            Some(SendingGuard {
                set: &self.in_flight,
                post_id,
            })
        } else {
            None
        }
    }

    /// Run one delivery round for `post_id`. Skips silently when the post is
    /// not in a deliverable state or another round is already in flight;
    /// failures are absorbed into the post's retry bookkeeping.
    pub async fn deliver(&self, db: &SqlitePool, post_id: i64) -> anyhow::Result<()> {
        let Some(_guard) = self.try_begin(post_id) else {
            tracing::debug!(post_id, "delivery already in flight, skipping");
            return Ok(());
        };

        let Some(post) = posts::get_post(db, post_id).await? else {
            tracing::warn!(post_id, "delivery requested for unknown post");
            return Ok(());
        };
        if !deliverable(&post) {
            tracing::debug!(post_id, status = %post.status, "post not deliverable, skipping");
            return Ok(());
        }

        let editors = routing::get_editor_ids(db).await?;
        if editors.is_empty() {
            tracing::warn!(post_id, "no editors configured, counting as failed round");
            posts::record_delivery_failure(db, post_id, "no editors configured").await?;
            return Ok(());
        }

        let mut errors: Vec<String> = Vec::new();
        let mut winner: Option<usize> = None;

        {
            let _serial = self.first_send_lock.lock().await;
            // Another round may have completed while this one waited.
            let Some(post) = posts::get_post(db, post_id).await? else {
                return Ok(());
            };
            if !deliverable(&post) {
                tracing::debug!(post_id, "post delivered while waiting, skipping");
                return Ok(());
            }

            for (i, editor) in editors.iter().enumerate() {
                let chat_id = editor.to_string();
                match self.send_to_one(&post, &chat_id).await {
                    Ok(Some(message_id)) => {
                        let changed = posts::transition(
                            db,
                            post_id,
                            &[PostStatus::Processing, PostStatus::SendFailed],
                            PostStatus::PendingReview,
                            StatusUpdate {
                                editor_message_id: Some(message_id),
                                ..Default::default()
                            },
                        )
                        .await?;
                        if changed {
                            tracing::info!(post_id, editor = %chat_id, message_id, "post delivered to editor");
                            audit::add_audit_log(
                                db,
                                Some(post_id),
                                "sent_to_editor",
                                Some(&chat_id),
                                Some(serde_json::json!({ "message_id": message_id })),
                            )
                            .await?;
                        }
                        winner = Some(i);
                        break;
                    }
                    Ok(None) => {
                        tracing::info!(post_id, editor = %chat_id, "editor unreachable, trying next");
                        errors.push(format!("editor {chat_id}: unreachable"));
                    }
                    Err(e) => {
                        tracing::warn!(post_id, editor = %chat_id, error = %e, "send to editor failed");
                        errors.push(format!("editor {chat_id}: {e}"));
                    }
                }
            }
        }

        let Some(winner) = winner else {
            let detail = if errors.is_empty() {
                "no editor accepted the post".to_string()
            } else {
                errors.join("; ")
            };
            posts::record_delivery_failure(db, post_id, &detail).await?;
            if let Some(post) = posts::get_post(db, post_id).await? {
                if post.status().ok() == Some(PostStatus::SendFailed) {
                    self.alerts
                        .alert(
                            self.messenger.as_ref(),
                            &format!("delivery_exhausted:{post_id}"),
                            &format!(
                                "Post {post_id} could not be delivered to any editor after {} attempts: {detail}",
                                post.delivery_attempts
                            ),
                        )
                        .await;
                }
            }
            return Ok(());
        };

        // Status is settled; the roster tail is informational fan-out and
        // individual failures are only logged. Editors up to and including
        // the winner already had their one attempt this round.
        let post = match posts::get_post(db, post_id).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        for editor in editors.iter().skip(winner + 1) {
            let chat_id = editor.to_string();
            if let Err(e) = self.send_to_one(&post, &chat_id).await {
                tracing::warn!(post_id, editor = %chat_id, error = %e, "fan-out to editor failed");
            }
        }
        Ok(())
    }

    /// Send the post to one editor: chunked summary text, then the PDF as a
    /// reply to the first chunk. Returns the first message id, or `None`
    /// when the recipient is unreachable (blocked the bot, unknown chat).
    async fn send_to_one(
        &self,
        post: &crate::schema::Post,
        chat_id: &str,
    ) -> Result<Option<i64>, SendError> {
        let mut text = post.display_summary().trim().to_string();
        if text.is_empty() {
            text = post
                .original_text
                .as_deref()
                .unwrap_or("")
                .trim()
                .to_string();
        }
        if text.is_empty() {
            text = format!("Post #{} from {}", post.id, post.source_channel);
        }

        let mut first_id: Option<i64> = None;
        for chunk in split_text(&text, CHUNK_LIMIT) {
            let result =
                send_with_retry(|| self.messenger.send_message(chat_id, &chunk)).await;
            match result {
                Ok(message_id) => {
                    first_id.get_or_insert(message_id);
                }
                Err(SendError::RecipientUnavailable(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        if !post.pdf_path.is_empty() {
            if std::path::Path::new(&post.pdf_path).exists() {
                let mut result = send_with_retry(|| {
                    self.messenger
                        .send_document(chat_id, &post.pdf_path, None, first_id)
                })
                .await;
                if result.as_ref().is_err_and(|e| e.is_retryable()) {
                    result = send_with_retry(|| {
                        self.messenger
                            .send_document(chat_id, &post.pdf_path, None, first_id)
                    })
                    .await;
                }
                if let Err(e) = result {
                    // The text already arrived; a lost attachment is not a
                    // failed delivery.
                    tracing::warn!(post_id = post.id, editor = %chat_id, error = %e, "PDF send incomplete");
                }
            } else {
                tracing::warn!(post_id = post.id, path = %post.pdf_path, "PDF missing on disk, sending text only");
            }
        }

        Ok(first_id)
    }
}

fn deliverable(post: &crate::schema::Post) -> bool {
    post.editor_message_id.is_none()
        && matches!(
            post.status().ok(),
            Some(PostStatus::Processing) | Some(PostStatus::SendFailed)
        )
}
