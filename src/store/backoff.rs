/// Bounded exponential backoff with a terminal state. The same policy backs
/// both the outbox dispatch retries and the editor-delivery retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_secs: i64,
    pub max_attempts: i64,
}

/// Shared by posts.record_delivery_failure and outbox.mark_failed.
pub const RETRY_POLICY: RetryPolicy = RetryPolicy {
    base_delay_secs: 60,
    max_attempts: 5,
};

impl RetryPolicy {
    /// Delay before the next retry after `attempts` recorded failures
    /// (including the one being recorded). `None` means the ceiling is
    /// reached and the entity goes terminal.
    pub fn backoff_after(&self, attempts: i64) -> Option<i64> {
        if attempts >= self.max_attempts {
            return None;
        }
        let exponent = (attempts - 1).max(0) as u32;
        Some(self.base_delay_secs << exponent)
    }
}
