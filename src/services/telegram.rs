use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const API_BASE: &str = "https://api.telegram.org";
const TEXT_TIMEOUT: Duration = Duration::from_secs(30);
const DOCUMENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Transport failure taxonomy. Components pick their retry behavior off
/// these classes, never off raw error strings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// "Slow down" signal carrying the advertised delay in seconds.
    #[error("rate limited, retry after {0}s")]
    RetryAfter(u64),
    /// The recipient blocked the bot, never started it, or the chat is gone.
    /// A soft skip for that one recipient, never a pipeline failure.
    #[error("recipient unavailable: {0}")]
    RecipientUnavailable(String),
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl SendError {
    /// Timeouts and connection drops may succeed on a retry; everything
    /// else either has its own protocol (rate limits) or will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Timeout | SendError::Connection(_))
    }
}

/// The messaging transport, reduced to what the pipeline needs. Both send
/// calls return the platform message id of the sent message.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<i64, SendError>;

    async fn send_document(
        &self,
        chat_id: &str,
        path: &str,
        caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<i64, SendError>;
}

/// Run a send once; honor a rate-limit signal by sleeping the advertised
/// delay and retrying exactly once more. Applies uniformly to every send.
pub async fn send_with_retry<T, F, Fut>(mut send: F) -> Result<T, SendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SendError>>,
{
    match send().await {
        Err(SendError::RetryAfter(secs)) => {
            tracing::warn!(retry_after = secs, "rate limited, honoring retry-after");
            tokio::time::sleep(Duration::from_secs(secs)).await;
            send().await
        }
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<ApiMessage>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Thin Telegram Bot API client over reqwest.
pub struct TelegramBot {
    client: reqwest::Client,
    token: String,
}

impl TelegramBot {
    pub fn new(token: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(TEXT_TIMEOUT).build()?;
        Ok(Self { client, token })
    }

    fn url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    fn classify_transport(err: reqwest::Error) -> SendError {
        if err.is_timeout() {
            SendError::Timeout
        } else if err.is_connect() {
            SendError::Connection(err.to_string())
        } else {
            SendError::Other(err.to_string())
        }
    }

    async fn parse_response(response: reqwest::Response) -> Result<i64, SendError> {
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| SendError::Other(format!("bad api response: {e}")))?;
        if body.ok {
            return body
                .result
                .map(|m| m.message_id)
                .ok_or_else(|| SendError::Other("ok response without message".into()));
        }
        if let Some(retry_after) = body.parameters.and_then(|p| p.retry_after) {
            return Err(SendError::RetryAfter(retry_after));
        }
        let description = body.description.unwrap_or_else(|| status.to_string());
        let lowered = description.to_lowercase();
        if body.error_code == Some(403)
            || lowered.contains("blocked")
            || lowered.contains("chat not found")
            || lowered.contains("user is deactivated")
        {
            return Err(SendError::RecipientUnavailable(description));
        }
        Err(SendError::Other(description))
    }
}

#[async_trait]
impl Messenger for TelegramBot {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<i64, SendError> {
        let response = self
            .client
            .post(self.url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(Self::classify_transport)?;
        Self::parse_response(response).await
    }

    async fn send_document(
        &self,
        chat_id: &str,
        path: &str,
        caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<i64, SendError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SendError::Other(format!("failed to read {path}: {e}")))?;
        let file_name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        if let Some(reply_to) = reply_to {
            form = form.text("reply_to_message_id", reply_to.to_string());
        }

        let response = self
            .client
            .post(self.url("sendDocument"))
            .timeout(DOCUMENT_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(Self::classify_transport)?;
        Self::parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_connection_drops_are_retryable() {
        assert!(SendError::Timeout.is_retryable());
        assert!(SendError::Connection("reset".into()).is_retryable());
        assert!(!SendError::RetryAfter(5).is_retryable());
        assert!(!SendError::RecipientUnavailable("blocked".into()).is_retryable());
        assert!(!SendError::Other("boom".into()).is_retryable());
    }

    #[tokio::test]
    async fn rate_limit_is_retried_exactly_once() {
        let mut calls = 0u32;
        let result = send_with_retry(|| {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt == 1 {
                    Err(SendError::RetryAfter(0))
                } else {
                    Ok(7i64)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn second_rate_limit_propagates() {
        let result: Result<i64, _> = send_with_retry(|| async { Err(SendError::RetryAfter(0)) }).await;
        assert!(matches!(result, Err(SendError::RetryAfter(0))));
    }
}
