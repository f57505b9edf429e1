//! Axum route handlers for the document, its checkpoints and its transcript.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::MutexGuard;

use crate::chat::ChatSession;
use crate::document::{CheckpointOutcome, DocumentPhase, RestoreReport, TranscriptEntry};
use crate::errors::AppError;
use crate::models::ResumeData;
use crate::readiness::ReadinessFlags;
use crate::state::AppState;
use crate::version::Checkpoint;

const DEFAULT_LOG_LIMIT: usize = 50;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub phase: DocumentPhase,
    #[serde(flatten)]
    pub flags: ReadinessFlags,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CheckpointListResponse {
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub entries: Vec<TranscriptEntry>,
}

// ────────────────────────────────────────────────────────────────────────────
// Document
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/document
pub async fn handle_get_document(
    State(state): State<AppState>,
) -> Result<Json<ResumeData>, AppError> {
    Ok(Json(state.document.get_data()?))
}

/// PUT /api/v1/document
///
/// Replaces the whole document. A document that no longer builds is rejected
/// with 422 and the previous content stays in place.
pub async fn handle_put_document(
    State(state): State<AppState>,
    Json(data): Json<ResumeData>,
) -> Result<Json<ResumeData>, AppError> {
    state.document.set_data(data).await?;
    Ok(Json(state.document.get_data()?))
}

/// GET /api/v1/document/readiness
pub async fn handle_readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        phase: state.document.phase(),
        flags: state.document.readiness_flags(),
    })
}

/// POST /api/v1/document/compiler/load
///
/// Explicit trigger for loading the compiler. Idempotent once loaded.
pub async fn handle_load_compiler(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, AppError> {
    state.document.load_compiler().await?;
    Ok(handle_readiness(State(state)).await)
}

/// GET /api/v1/document/preview
pub async fn handle_preview(State(state): State<AppState>) -> Result<Response, AppError> {
    let svg = state.document.render_preview().await?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
}

/// GET /api/v1/document/export
///
/// Final PDF as a download.
pub async fn handle_export(State(state): State<AppState>) -> Result<Response, AppError> {
    let pdf = state.document.export_pdf().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"resume.pdf\"",
            ),
        ],
        pdf,
    )
        .into_response())
}

/// DELETE /api/v1/document/store
///
/// Irreversible: deletes the whole store, including history and transcript,
/// and starts over from the template defaults.
pub async fn handle_reset(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    let _paused = pause_chat(&state)?;
    state.document.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/document/events
///
/// Server-sent `updated` and `restored` events, one JSON payload each. The
/// subscription ends when the client disconnects.
pub async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.document.watch();
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let frame = Event::default().event(event.name()).json_data(&event);
        Some((frame, subscription))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ────────────────────────────────────────────────────────────────────────────
// Checkpoints
// ────────────────────────────────────────────────────────────────────────────

/// Held across checkpoint changes. While an agent turn runs they fail with
/// 409 so no marker lands between a tool call and its result.
fn pause_chat(state: &AppState) -> Result<Option<MutexGuard<'_, ()>>, AppError> {
    Ok(state.chat.as_deref().map(ChatSession::pause).transpose()?)
}

/// GET /api/v1/checkpoints?limit=N
pub async fn handle_list_checkpoints(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<CheckpointListResponse>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let checkpoints = state.document.checkpoints(limit).await?;
    Ok(Json(CheckpointListResponse { checkpoints }))
}

/// POST /api/v1/checkpoints
///
/// "Nothing to commit" is a normal 200 with `status: "nothing_to_commit"`.
pub async fn handle_create_checkpoint(
    State(state): State<AppState>,
) -> Result<Json<CheckpointOutcome>, AppError> {
    let _paused = pause_chat(&state)?;
    Ok(Json(state.document.create_checkpoint().await?))
}

/// POST /api/v1/checkpoints/:id/restore
pub async fn handle_restore_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RestoreReport>, AppError> {
    let _paused = pause_chat(&state)?;
    Ok(Json(state.document.restore_to_checkpoint(&id).await?))
}

// ────────────────────────────────────────────────────────────────────────────
// Transcript
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/transcript
pub async fn handle_transcript(State(state): State<AppState>) -> Json<TranscriptResponse> {
    Json(TranscriptResponse {
        entries: state.document.transcript().entries().await,
    })
}
