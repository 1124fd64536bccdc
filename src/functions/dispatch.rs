use crate::services::processor::{HandoffPayload, ProcessorHandoff, SubmitError};
use crate::store::outbox;
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// With pacing enabled the worker drains one entry per round so detected
/// posts reach the processor spaced out instead of in a burst.
const PACED_BATCH: i64 = 1;
const UNPACED_BATCH: i64 = 10;
/// How often a persistent tick failure is worth repeating at warn level.
const TICK_WARN_INTERVAL: Duration = Duration::from_secs(300);

/// Drain one batch of pending outbox entries to the processor. Returns the
/// number successfully handed off. Per-entry failures are recorded on the
/// entry and never abort the batch. A non-zero `pacing` is slept after each
/// successful handoff so detected posts reach the processor spaced out.
pub async fn dispatch_tick(
    db: &SqlitePool,
    processor: &dyn ProcessorHandoff,
    limit: i64,
    pacing: Duration,
) -> anyhow::Result<u32> {
    let batch = outbox::get_pending_batch(db, limit).await?;
    let mut sent = 0u32;

    for entry in batch {
        let payload = HandoffPayload {
            post_text: entry.post_text.clone(),
            pdf_path: if entry.pdf_missing {
                String::new()
            } else {
                entry.pdf_path.clone()
            },
            message_id: entry.message_id,
            channel_id: entry.channel_id.clone(),
            source_channel: entry.source_channel.clone(),
        };
        match processor.submit(&payload).await {
            Ok(()) => {
                outbox::mark_sent(db, entry.id).await?;
                tracing::info!(
                    outbox_id = entry.id,
                    message_id = entry.message_id,
                    channel = %entry.channel_id,
                    "outbox entry handed off to processor"
                );
                sent += 1;
                if !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
            }
            Err(SubmitError::Rejected(detail)) => {
                tracing::warn!(outbox_id = entry.id, detail = %detail, "processor rejected entry, not retrying");
                outbox::mark_failed_terminal(db, entry.id, &detail).await?;
            }
            Err(SubmitError::Unavailable(detail)) => {
                tracing::warn!(
                    outbox_id = entry.id,
                    attempts = entry.attempts + 1,
                    detail = %detail,
                    "processor unavailable, backing off"
                );
                outbox::mark_failed(db, entry.id, &detail, entry.attempts + 1).await?;
            }
        }
    }
    Ok(sent)
}

/// The monitor can come up before the schema migration has run; that one
/// condition repeats every round until fixed and is worth throttling.
/// Anything else is unexpected and gets logged each time.
fn quiet_tick_error(error: &anyhow::Error) -> bool {
    error.to_string().contains("no such table")
}

/// Long-running dispatch worker. `pacing` spaces successive handoffs apart;
/// zero disables it and the worker drains in batches of ten.
pub async fn dispatch_loop(
    db: SqlitePool,
    processor: std::sync::Arc<dyn ProcessorHandoff>,
    pacing: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(pacing_secs = pacing.as_secs(), "outbox dispatch worker started");
    let limit = if pacing.is_zero() { UNPACED_BATCH } else { PACED_BATCH };
    let mut last_warn: Option<Instant> = None;

    loop {
        match dispatch_tick(&db, processor.as_ref(), limit, pacing).await {
            Ok(sent) => {
                if sent > 0 {
                    tracing::debug!(sent, "dispatch round complete");
                }
            }
            Err(e) if quiet_tick_error(&e) => {
                if last_warn.is_none_or(|t| t.elapsed() >= TICK_WARN_INTERVAL) {
                    tracing::warn!(error = %e, "dispatch tick failed");
                    last_warn = Some(Instant::now());
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dispatch tick failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
    tracing::info!("outbox dispatch worker stopped");
}
