use crate::functions::delivery::DeliveryPipeline;
use crate::functions::review::{Review, ReviewError};
use crate::schema::PostStatus;
use crate::store::outbox::{self, NewOutboxEntry};
use crate::store::{posts, routing};
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Json, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;

const BODY_LIMIT: usize = 64 * 1024;
/// Upper bound on accepted post ids; anything bigger is garbage input, not a
/// row we could ever have created.
const POST_ID_MAX: i64 = 2_000_000_000;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub pipeline: Arc<DeliveryPipeline>,
    pub review: Arc<Review>,
    pub api_token: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/incoming/post", post(incoming_post))
        .route("/outbox", post(outbox_intake))
        .route("/review/{id}/approve", post(approve))
        .route("/review/{id}/reject", post(reject))
        .route("/review/{id}/summary", post(edit_summary))
        .route("/review/{id}/schedule", post(schedule))
        .route("/review/{id}/cancel-schedule", post(cancel_schedule))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn error_reply(status: StatusCode, message: &str) -> Response {
    reply(status, json!({ "ok": false, "error": message }))
}

fn internal(post_id: i64, e: anyhow::Error) -> Response {
    tracing::error!(post_id, error = %e, "api handler error");
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Bearer auth shared by all mutating endpoints. An unconfigured token means
/// the API is disabled, not open.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if state.api_token.is_empty() {
        return Err(error_reply(StatusCode::FORBIDDEN, "api disabled"));
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if presented != state.api_token {
        tracing::warn!("api call with missing or wrong token");
        return Err(error_reply(StatusCode::FORBIDDEN, "invalid token"));
    }
    Ok(())
}

fn valid_post_id(id: i64) -> bool {
    (1..=POST_ID_MAX).contains(&id)
}

/// A body over the size limit surfaces while buffering, before JSON parsing;
/// that is the caller sending too much, not sending garbage.
fn rejection_reply(rejection: JsonRejection) -> Response {
    match rejection {
        JsonRejection::BytesRejection(_) => {
            error_reply(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
        }
        other => {
            tracing::warn!(error = %other, "malformed payload");
            error_reply(StatusCode::BAD_REQUEST, "malformed payload")
        }
    }
}

#[derive(Debug, Deserialize)]
struct IncomingPost {
    post_id: i64,
    summary: Option<String>,
    original_text: Option<String>,
    pdf_path: Option<String>,
}

/// Callback from the downstream processor: the summary for a post is ready
/// and delivery to editors should start. Authentication comes first; every
/// later check leaks nothing to unauthenticated callers.
async fn incoming_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<IncomingPost>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejection_reply(rejection),
    };
    if !valid_post_id(payload.post_id) {
        return error_reply(StatusCode::BAD_REQUEST, "post_id out of range");
    }
    let post_id = payload.post_id;

    let editors = match routing::get_editor_ids(&state.db).await {
        Ok(e) => e,
        Err(e) => return internal(post_id, e),
    };
    if editors.is_empty() {
        tracing::warn!(post_id, "webhook received but no editors are configured");
        return error_reply(StatusCode::SERVICE_UNAVAILABLE, "no editors configured");
    }

    let post = match posts::get_post(&state.db, post_id).await {
        Ok(Some(p)) => p,
        Ok(None) => return error_reply(StatusCode::NOT_FOUND, "unknown post"),
        Err(e) => return internal(post_id, e),
    };
    let deliverable = post.editor_message_id.is_none()
        && matches!(
            post.status().ok(),
            Some(PostStatus::Processing) | Some(PostStatus::SendFailed)
        );
    if !deliverable {
        // Replayed callback; the post already went out. Acknowledge so the
        // caller stops retrying.
        tracing::info!(post_id, status = %post.status, "webhook replay for already-delivered post");
        return reply(StatusCode::OK, json!({ "ok": true, "already_sent": true }));
    }

    if let Err(e) = posts::update_post_content(
        &state.db,
        post_id,
        payload.summary.as_deref(),
        payload.original_text.as_deref(),
        payload.pdf_path.as_deref(),
    )
    .await
    {
        return internal(post_id, e);
    }

    // Respond immediately; delivery runs in the background and failures land
    // in the post's retry bookkeeping.
    let bg = state.clone();
    tokio::spawn(async move {
        if let Err(e) = bg.pipeline.deliver(&bg.db, post_id).await {
            tracing::error!(post_id, error = %e, "background delivery failed");
        }
    });

    reply(StatusCode::OK, json!({ "ok": true, "already_sent": false }))
}

#[derive(Debug, Deserialize)]
struct DetectedPost {
    channel_id: String,
    message_id: i64,
    #[serde(default)]
    pdf_path: String,
    #[serde(default)]
    pdf_missing: bool,
    #[serde(default)]
    post_text: String,
    #[serde(default)]
    source_channel: String,
}

/// Intake from the channel monitor: one detected source message becomes a
/// durable outbox entry. Re-detection of the same message is a no-op.
async fn outbox_intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<DetectedPost>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejection_reply(rejection),
    };
    if payload.channel_id.trim().is_empty() || payload.message_id < 1 {
        return error_reply(StatusCode::BAD_REQUEST, "channel_id and message_id required");
    }

    let result = outbox::insert_outbox(
        &state.db,
        NewOutboxEntry {
            channel_id: payload.channel_id,
            message_id: payload.message_id,
            pdf_path: payload.pdf_path,
            pdf_missing: payload.pdf_missing,
            post_text: payload.post_text,
            source_channel: payload.source_channel,
        },
    )
    .await;
    match result {
        Ok(Some(id)) => {
            tracing::info!(outbox_id = id, "detected post queued for dispatch");
            reply(StatusCode::OK, json!({ "ok": true, "id": id, "duplicate": false }))
        }
        Ok(None) => reply(StatusCode::OK, json!({ "ok": true, "duplicate": true })),
        Err(e) => internal(0, e),
    }
}

fn review_reply(result: Result<serde_json::Value, ReviewError>) -> Response {
    match result {
        Ok(body) => reply(StatusCode::OK, body),
        Err(e) => {
            let status = match &e {
                ReviewError::NotFound => StatusCode::NOT_FOUND,
                ReviewError::AlreadyHandled | ReviewError::StillDelivering => StatusCode::CONFLICT,
                ReviewError::NoTargetChannel => StatusCode::UNPROCESSABLE_ENTITY,
                ReviewError::PublishFailed(_) => StatusCode::BAD_GATEWAY,
                ReviewError::Validation(_) => StatusCode::BAD_REQUEST,
                ReviewError::Internal(err) => {
                    tracing::error!(error = %err, "review operation failed");
                    return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
                }
            };
            error_reply(status, &e.to_string())
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ActorPayload {
    actor: Option<String>,
}

// Review endpoints tolerate an absent or empty body; the actor defaults.
fn actor_of(payload: Result<Json<ActorPayload>, JsonRejection>) -> String {
    payload
        .ok()
        .and_then(|Json(p)| p.actor)
        .unwrap_or_else(|| "api".to_string())
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<ActorPayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    if !valid_post_id(id) {
        return error_reply(StatusCode::BAD_REQUEST, "post_id out of range");
    }
    let actor = actor_of(payload);
    review_reply(
        state
            .review
            .approve(&state.db, id, &actor)
            .await
            .map(|channels| json!({ "ok": true, "channels": channels })),
    )
}

async fn reject(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<ActorPayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    if !valid_post_id(id) {
        return error_reply(StatusCode::BAD_REQUEST, "post_id out of range");
    }
    let actor = actor_of(payload);
    review_reply(
        state
            .review
            .reject(&state.db, id, &actor)
            .await
            .map(|()| json!({ "ok": true })),
    )
}

#[derive(Debug, Deserialize)]
struct SummaryPayload {
    summary: String,
    actor: Option<String>,
}

async fn edit_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<SummaryPayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejection_reply(rejection),
    };
    if !valid_post_id(id) {
        return error_reply(StatusCode::BAD_REQUEST, "post_id out of range");
    }
    let actor = payload.actor.as_deref().unwrap_or("api");
    review_reply(
        state
            .review
            .edit_summary(&state.db, id, actor, &payload.summary)
            .await
            .map(|()| json!({ "ok": true })),
    )
}

#[derive(Debug, Deserialize)]
struct SchedulePayload {
    publish_at: i64,
    actor: Option<String>,
}

async fn schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<SchedulePayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Json(payload) = match payload {
        Ok(p) => p,
        Err(rejection) => return rejection_reply(rejection),
    };
    if !valid_post_id(id) {
        return error_reply(StatusCode::BAD_REQUEST, "post_id out of range");
    }
    let actor = payload.actor.as_deref().unwrap_or("api");
    review_reply(
        state
            .review
            .schedule(&state.db, id, actor, payload.publish_at)
            .await
            .map(|()| json!({ "ok": true })),
    )
}

async fn cancel_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<ActorPayload>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    if !valid_post_id(id) {
        return error_reply(StatusCode::BAD_REQUEST, "post_id out of range");
    }
    let actor = actor_of(payload);
    review_reply(
        state
            .review
            .cancel_schedule(&state.db, id, &actor)
            .await
            .map(|()| json!({ "ok": true })),
    )
}

async fn health(State(state): State<AppState>) -> Response {
    match posts::counts_by_status(&state.db).await {
        Ok(counts) => {
            let posts: serde_json::Map<String, serde_json::Value> = counts
                .into_iter()
                .map(|(status, count)| (status.as_str().to_string(), json!(count)))
                .collect();
            reply(StatusCode::OK, json!({ "ok": true, "posts": posts }))
        }
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}
