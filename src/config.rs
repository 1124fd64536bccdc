use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at startup from the environment (with
/// `.env` support via dotenvy).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: String,
    /// Bearer token for the HTTP API. Empty disables every mutating endpoint.
    pub api_token: String,
    pub bot_token: String,
    pub processor_url: String,
    pub pdf_storage_root: PathBuf,
    pub alert_chat_id: Option<String>,
    /// Spacing between successive outbox handoffs; zero means batch mode.
    pub dispatch_pacing: Duration,
    pub discussion_resolver_url: Option<String>,
    pub discussion_resolver_token: String,
    pub fallback_channel: Option<String>,
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("{key} must be set"))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let pacing_minutes: u64 = optional("DISPATCH_PACING_MINUTES")
            .map(|v| v.parse())
            .transpose()
            .context("DISPATCH_PACING_MINUTES must be a whole number of minutes")?
            .unwrap_or(0);

        Ok(Self {
            database_path: optional("DATABASE_PATH").unwrap_or_else(|| "redaktor.db".into()),
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8090".into()),
            api_token: optional("API_TOKEN").unwrap_or_default(),
            bot_token: required("TELEGRAM_BOT_TOKEN")?,
            processor_url: required("PROCESSOR_WEBHOOK_URL")?,
            pdf_storage_root: PathBuf::from(
                optional("PDF_STORAGE_ROOT").unwrap_or_else(|| "./pdfs".into()),
            ),
            alert_chat_id: optional("ALERT_CHAT_ID"),
            dispatch_pacing: Duration::from_secs(pacing_minutes * 60),
            discussion_resolver_url: optional("DISCUSSION_RESOLVER_URL"),
            discussion_resolver_token: optional("DISCUSSION_RESOLVER_TOKEN").unwrap_or_default(),
            fallback_channel: optional("FALLBACK_CHANNEL"),
        })
    }
}
