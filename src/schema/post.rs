use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a post. The set is fixed; anything else coming out of
/// storage or an API call is a hard error, not an ad hoc string branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Processing,
    PendingReview,
    Publishing,
    Scheduled,
    Published,
    Rejected,
    SendFailed,
    PublishFailed,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid post status: {0:?}")]
pub struct InvalidStatus(pub String);

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Processing => "processing",
            PostStatus::PendingReview => "pending_review",
            PostStatus::Publishing => "publishing",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Rejected => "rejected",
            PostStatus::SendFailed => "send_failed",
            PostStatus::PublishFailed => "publish_failed",
        }
    }
}

impl FromStr for PostStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(PostStatus::Processing),
            "pending_review" => Ok(PostStatus::PendingReview),
            "publishing" => Ok(PostStatus::Publishing),
            "scheduled" => Ok(PostStatus::Scheduled),
            "published" => Ok(PostStatus::Published),
            "rejected" => Ok(PostStatus::Rejected),
            "send_failed" => Ok(PostStatus::SendFailed),
            "publish_failed" => Ok(PostStatus::PublishFailed),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row from the posts table. Timestamps are unix epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub source_channel: String,
    pub source_message_id: i64,
    pub original_text: Option<String>,
    pub pdf_path: String,
    pub summary: Option<String>,
    pub edited_summary: Option<String>,
    pub editor_message_id: Option<i64>,
    pub status: String,
    pub scheduled_at: Option<i64>,
    pub delivery_attempts: i64,
    pub last_delivery_error: Option<String>,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    /// Text shown to editors and published to channels: the edited summary
    /// overrides the generated one when present.
    pub fn display_summary(&self) -> &str {
        self.edited_summary
            .as_deref()
            .or(self.summary.as_deref())
            .unwrap_or("")
    }

    pub fn status(&self) -> Result<PostStatus, InvalidStatus> {
        self.status.parse()
    }

    /// Combined text used for keyword routing.
    pub fn routing_text(&self) -> String {
        format!(
            "{} {}",
            self.original_text.as_deref().unwrap_or(""),
            self.display_summary()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            PostStatus::Processing,
            PostStatus::PendingReview,
            PostStatus::Publishing,
            PostStatus::Scheduled,
            PostStatus::Published,
            PostStatus::Rejected,
            PostStatus::SendFailed,
            PostStatus::PublishFailed,
        ] {
            assert_eq!(status.as_str().parse::<PostStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!("approved_maybe".parse::<PostStatus>().is_err());
        assert!("".parse::<PostStatus>().is_err());
    }

    #[test]
    fn edited_summary_overrides_generated() {
        let post = Post {
            id: 1,
            source_channel: "-100".into(),
            source_message_id: 1,
            original_text: None,
            pdf_path: String::new(),
            summary: Some("generated".into()),
            edited_summary: Some("edited".into()),
            editor_message_id: None,
            status: "pending_review".into(),
            scheduled_at: None,
            delivery_attempts: 0,
            last_delivery_error: None,
            next_retry_at: None,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(post.display_summary(), "edited");
    }
}
