use crate::schema::Post;
use crate::services::discussion::DiscussionResolver;
use crate::services::telegram::{Messenger, SendError, send_with_retry};
use crate::text::{CHUNK_LIMIT, split_text, strip_markdown_asterisks};
use anyhow::{Context, bail};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Pause between consecutive target channels, to stay clear of broadcast
/// rate limits.
const INTER_CHANNEL_DELAY: Duration = Duration::from_secs(1);
/// Pause between the last text message and the PDF upload.
const PRE_DOCUMENT_DELAY: Duration = Duration::from_secs(2);
/// The discussion-group copy of a channel post materializes with a lag;
/// poll for it a few times before falling back to an in-channel reply.
const DISCUSSION_ATTEMPTS: u32 = 3;
const DISCUSSION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Publishes approved posts to their resolved target channels. A single
/// instance is shared by manual approval and the scheduler; the internal
/// lock serializes whole publications so channel pacing holds globally.
pub struct Publisher {
    messenger: Arc<dyn Messenger>,
    discussion: Option<Arc<DiscussionResolver>>,
    pdf_storage_root: PathBuf,
    publish_lock: tokio::sync::Mutex<()>,
}

impl Publisher {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        discussion: Option<Arc<DiscussionResolver>>,
        pdf_storage_root: PathBuf,
    ) -> Self {
        Self {
            messenger,
            discussion,
            pdf_storage_root,
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Send the post's text to every channel in order; each channel gets the
    /// PDF attached under its own copy of the post. Text failure on any
    /// channel fails the publication; messages already out stay out
    /// (re-approval re-sends).
    pub async fn publish(&self, post: &Post, channels: &[String]) -> anyhow::Result<()> {
        if channels.is_empty() {
            bail!("no target channels resolved for post {}", post.id);
        }
        let _lock = self.publish_lock.lock().await;

        let text = strip_markdown_asterisks(post.display_summary()).trim().to_string();
        if text.is_empty() {
            bail!("post {} has no publishable text", post.id);
        }
        let chunks = split_text(&text, CHUNK_LIMIT);

        for (i, channel) in channels.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(INTER_CHANNEL_DELAY).await;
            }
            let mut first_id: Option<i64> = None;
            for chunk in &chunks {
                let message_id = self
                    .send_chunk(channel, chunk)
                    .await
                    .with_context(|| format!("sending post {} to channel {channel}", post.id))?;
                first_id.get_or_insert(message_id);
            }
            tracing::info!(post_id = post.id, channel = %channel, "post published to channel");

            if !post.pdf_path.is_empty() {
                tokio::time::sleep(PRE_DOCUMENT_DELAY).await;
                self.attach_pdf(post, channel, first_id.unwrap_or_default()).await;
            }
        }
        Ok(())
    }

    /// One chunk to one channel: rate limits are honored once inside
    /// `send_with_retry`, and a transient transport failure gets one more
    /// full attempt after a short pause.
    async fn send_chunk(&self, channel: &str, chunk: &str) -> Result<i64, SendError> {
        match send_with_retry(|| self.messenger.send_message(channel, chunk)).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!(channel = %channel, error = %e, "channel send failed, retrying once");
                tokio::time::sleep(DISCUSSION_RETRY_DELAY).await;
                send_with_retry(|| self.messenger.send_message(channel, chunk)).await
            }
            other => other,
        }
    }

    /// Best-effort PDF attachment: preferably as a comment in the channel's
    /// discussion group, otherwise as a reply in the channel itself. Never
    /// fails the publication.
    async fn attach_pdf(&self, post: &Post, channel: &str, channel_message_id: i64) {
        if !self.pdf_path_is_safe(&post.pdf_path) {
            tracing::warn!(post_id = post.id, path = %post.pdf_path, "PDF path outside storage root, refusing to send");
            return;
        }
        if !Path::new(&post.pdf_path).exists() {
            tracing::warn!(post_id = post.id, path = %post.pdf_path, "PDF missing on disk, published text only");
            return;
        }

        if let Some(resolver) = &self.discussion {
            'attempts: for attempt in 1..=DISCUSSION_ATTEMPTS {
                if let Some((chat_id, message_id)) =
                    resolver.resolve(channel, channel_message_id).await
                {
                    let chat = chat_id.to_string();
                    match send_with_retry(|| {
                        self.messenger
                            .send_document(&chat, &post.pdf_path, None, Some(message_id))
                    })
                    .await
                    {
                        Ok(_) => {
                            tracing::info!(post_id = post.id, chat = %chat, "PDF attached in discussion group");
                            return;
                        }
                        Err(e) if e.is_retryable() => {
                            tracing::warn!(post_id = post.id, chat = %chat, error = %e, "discussion PDF send failed, retrying");
                        }
                        Err(e) => {
                            tracing::warn!(post_id = post.id, chat = %chat, error = %e, "discussion PDF send failed");
                            break 'attempts;
                        }
                    }
                }
                if attempt < DISCUSSION_ATTEMPTS {
                    tokio::time::sleep(DISCUSSION_RETRY_DELAY).await;
                }
            }
        }

        match send_with_retry(|| {
            self.messenger
                .send_document(channel, &post.pdf_path, None, Some(channel_message_id))
        })
        .await
        {
            Ok(_) => tracing::info!(post_id = post.id, channel = %channel, "PDF attached as channel reply"),
            Err(e) => {
                tracing::warn!(post_id = post.id, channel = %channel, error = %e, "PDF channel reply failed")
            }
        }
    }

    fn pdf_path_is_safe(&self, path: &str) -> bool {
        let path = Path::new(path);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return false;
        }
        path.starts_with(&self.pdf_storage_root)
    }
}
