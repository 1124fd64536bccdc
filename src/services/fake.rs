//! Test doubles for the external collaborators.

use crate::services::processor::{HandoffPayload, ProcessorHandoff, SubmitError};
use crate::services::telegram::{Messenger, SendError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentItem {
    Message { chat_id: String, text: String },
    Document { chat_id: String, path: String, reply_to: Option<i64> },
}

/// In-memory messenger with per-chat scripted failures. Each queued error is
/// consumed by exactly one call; once the queue is empty the chat succeeds.
#[derive(Default)]
pub struct FakeMessenger {
    failures: Mutex<HashMap<String, VecDeque<SendError>>>,
    sent: Mutex<Vec<SentItem>>,
    next_id: AtomicI64,
}

impl FakeMessenger {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    pub fn fail_next(&self, chat_id: &str, error: SendError) {
        self.failures
            .lock()
            .unwrap()
            .entry(chat_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn sent(&self) -> Vec<SentItem> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat_id: &str) -> Vec<SentItem> {
        self.sent()
            .into_iter()
            .filter(|item| match item {
                SentItem::Message { chat_id: c, .. } => c == chat_id,
                SentItem::Document { chat_id: c, .. } => c == chat_id,
            })
            .collect()
    }

    fn take_failure(&self, chat_id: &str) -> Option<SendError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(chat_id)
            .and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<i64, SendError> {
        if let Some(err) = self.take_failure(chat_id) {
            return Err(err);
        }
        self.sent.lock().unwrap().push(SentItem::Message {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_document(
        &self,
        chat_id: &str,
        path: &str,
        _caption: Option<&str>,
        reply_to: Option<i64>,
    ) -> Result<i64, SendError> {
        if let Some(err) = self.take_failure(chat_id) {
            return Err(err);
        }
        self.sent.lock().unwrap().push(SentItem::Document {
            chat_id: chat_id.to_string(),
            path: path.to_string(),
            reply_to,
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Processor double with a queue of scripted outcomes; once the queue runs
/// dry every submission is accepted.
#[derive(Default)]
pub struct FakeProcessor {
    outcomes: Mutex<VecDeque<Result<(), SubmitError>>>,
    received: Mutex<Vec<HandoffPayload>>,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: Result<(), SubmitError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn received(&self) -> Vec<HandoffPayload> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessorHandoff for FakeProcessor {
    async fn submit(&self, payload: &HandoffPayload) -> Result<(), SubmitError> {
        self.received.lock().unwrap().push(payload.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}
