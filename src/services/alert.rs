use crate::services::telegram::Messenger;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum spacing between two alerts sharing the same key.
const ALERT_COOLDOWN: Duration = Duration::from_secs(900);

/// Sends operator alerts to a Telegram chat, suppressing repeats of the same
/// alert key within the cooldown window. Delivery failures are logged and
/// swallowed; alerting must never take the caller down with it.
pub struct AlertThrottle {
    chat_id: Option<String>,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertThrottle {
    pub fn new(chat_id: Option<String>) -> Self {
        Self {
            chat_id,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when an alert for `key` may go out now, and records the
    /// send. Callers should only invoke this when they are about to send.
    fn admit(&self, key: &str) -> bool {
        let mut last = self.last_sent.lock().unwrap();
        let now = Instant::now();
        if let Some(ts) = last.get(key) {
            if now.duration_since(*ts) < ALERT_COOLDOWN {
                return false;
            }
        }
        last.insert(key.to_string(), now);
        true
    }

    pub async fn alert(&self, messenger: &dyn Messenger, key: &str, text: &str) {
        let Some(chat_id) = &self.chat_id else {
            tracing::warn!(key, text, "alert chat not configured, dropping alert");
            return;
        };
        if !self.admit(key) {
            tracing::debug!(key, "alert suppressed by cooldown");
            return;
        }
        if let Err(e) = messenger.send_message(chat_id, text).await {
            tracing::warn!(key, error = %e, "failed to deliver operator alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_alert_within_cooldown_is_suppressed() {
        let throttle = AlertThrottle::new(Some("ops".into()));
        assert!(throttle.admit("delivery_exhausted:7"));
        assert!(!throttle.admit("delivery_exhausted:7"));
    }

    #[test]
    fn distinct_keys_do_not_share_a_window() {
        let throttle = AlertThrottle::new(Some("ops".into()));
        assert!(throttle.admit("delivery_exhausted:7"));
        assert!(throttle.admit("delivery_exhausted:8"));
    }
}
