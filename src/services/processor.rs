use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Fixed delays for re-trying a gateway timeout inside one dispatch attempt.
/// Exhausting them fails the round; the outbox backoff takes over from there.
const GATEWAY_TIMEOUT_DELAYS: [u64; 3] = [1, 3, 5];

/// Payload handed off to the downstream summarization processor.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffPayload {
    pub post_text: String,
    pub pdf_path: String,
    pub message_id: i64,
    pub channel_id: String,
    pub source_channel: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    /// The processor refused the payload outright; re-sending the same
    /// payload will never succeed. Terminal for the outbox entry.
    #[error("rejected by processor: {0}")]
    Rejected(String),
    /// Transient: network trouble, 5xx, or a gateway timeout that survived
    /// the in-round retries. The outbox backoff path applies.
    #[error("processor unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ProcessorHandoff: Send + Sync {
    async fn submit(&self, payload: &HandoffPayload) -> Result<(), SubmitError>;
}

/// What to do with one HTTP response from the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    Rejected,
    RetryLater,
    GatewayTimeout,
}

/// Pure classification of a processor response. Success requires a 2xx whose
/// body, when it confirms receipt at all, does not carry a negative ack.
fn classify(status: u16, body: Option<&serde_json::Value>) -> Verdict {
    match status {
        200..=299 => {
            if body.and_then(|b| b.get("ok")).and_then(|v| v.as_bool()) == Some(false) {
                Verdict::Rejected
            } else {
                Verdict::Accepted
            }
        }
        504 => Verdict::GatewayTimeout,
        400..=499 => Verdict::Rejected,
        _ => Verdict::RetryLater,
    }
}

pub struct ProcessorClient {
    client: reqwest::Client,
    webhook_url: String,
}

impl ProcessorClient {
    pub fn new(webhook_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    async fn post_once(&self, payload: &HandoffPayload) -> Result<(Verdict, String), SubmitError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| SubmitError::Unavailable(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: Option<serde_json::Value> = serde_json::from_str(&text).ok();
        let excerpt: String = text.chars().take(500).collect();
        Ok((classify(status, body.as_ref()), format!("{status}: {excerpt}")))
    }
}

#[async_trait]
impl ProcessorHandoff for ProcessorClient {
    async fn submit(&self, payload: &HandoffPayload) -> Result<(), SubmitError> {
        let (mut verdict, mut detail) = self.post_once(payload).await?;

        // A gateway timeout usually means the processor is still chewing on
        // the request; a couple of short in-round retries avoid counting a
        // slow success as a failed attempt.
        if verdict == Verdict::GatewayTimeout {
            for delay in GATEWAY_TIMEOUT_DELAYS {
                tracing::warn!(
                    message_id = payload.message_id,
                    delay,
                    "processor gateway timeout, retrying shortly"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
                (verdict, detail) = self.post_once(payload).await?;
                if verdict != Verdict::GatewayTimeout {
                    break;
                }
            }
        }

        match verdict {
            Verdict::Accepted => Ok(()),
            Verdict::Rejected => Err(SubmitError::Rejected(detail)),
            Verdict::RetryLater => Err(SubmitError::Unavailable(detail)),
            Verdict::GatewayTimeout => Err(SubmitError::Unavailable(format!(
                "gateway timeout after in-round retries ({detail})"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn plain_2xx_is_accepted() {
        assert_eq!(classify(200, None), Verdict::Accepted);
        assert_eq!(classify(204, None), Verdict::Accepted);
        assert_eq!(classify(200, Some(&json(r#"{"ok": true}"#))), Verdict::Accepted);
        assert_eq!(classify(200, Some(&json(r#"{"status": "queued"}"#))), Verdict::Accepted);
    }

    #[test]
    fn negative_ack_in_2xx_body_is_a_rejection() {
        assert_eq!(classify(200, Some(&json(r#"{"ok": false}"#))), Verdict::Rejected);
    }

    #[test]
    fn non_timeout_4xx_is_terminal() {
        assert_eq!(classify(400, None), Verdict::Rejected);
        assert_eq!(classify(422, None), Verdict::Rejected);
        assert_eq!(classify(404, None), Verdict::Rejected);
    }

    #[test]
    fn gateway_timeout_is_distinguished_from_other_5xx() {
        assert_eq!(classify(504, None), Verdict::GatewayTimeout);
        assert_eq!(classify(500, None), Verdict::RetryLater);
        assert_eq!(classify(503, None), Verdict::RetryLater);
    }
}
