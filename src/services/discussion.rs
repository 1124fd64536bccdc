use serde::Deserialize;
use std::time::Duration;

/// Resolves the discussion-group message that mirrors a channel post, so the
/// PDF can be attached as a comment under it. Resolution is best-effort: any
/// failure is logged and reported as "no venue", never as an error, because
/// publication must not depend on the discussion feature.
pub struct DiscussionResolver {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    ok: bool,
    discussion_chat_id: Option<i64>,
    discussion_message_id: Option<i64>,
}

impl DiscussionResolver {
    pub fn new(base_url: String, token: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Look up the discussion-group copy of `message_id` in `channel_id`.
    /// Returns `(discussion_chat_id, discussion_message_id)` when the channel
    /// has a linked group and the copy has already materialized.
    pub async fn resolve(&self, channel_id: &str, message_id: i64) -> Option<(i64, i64)> {
        let url = format!("{}/resolve", self.base_url.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "channel_id": channel_id, "message_id": message_id }));
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        let result = request.send().await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(channel_id, message_id, error = %e, "discussion resolve request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!(
                channel_id,
                message_id,
                status = response.status().as_u16(),
                "discussion resolve returned non-success"
            );
            return None;
        }
        match response.json::<ResolveResponse>().await {
            Ok(body) if body.ok => match (body.discussion_chat_id, body.discussion_message_id) {
                (Some(chat), Some(msg)) => Some((chat, msg)),
                _ => None,
            },
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(channel_id, message_id, error = %e, "discussion resolve body unreadable");
                None
            }
        }
    }
}
