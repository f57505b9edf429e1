//! Axum route handlers for the chat agent.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatSession, TurnOutcome};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

fn session(state: &AppState) -> Result<&ChatSession, AppError> {
    state.chat.as_deref().ok_or_else(|| {
        AppError::Unavailable("Chat is disabled: ANTHROPIC_API_KEY is not set".to_string())
    })
}

/// POST /api/v1/chat
///
/// Runs one agent turn to completion and returns everything the model and
/// the tools produced. 409 while another turn is running.
pub async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<TurnOutcome>, AppError> {
    if request.message.trim().is_empty() {
        return Err(AppError::Validation("message cannot be empty".to_string()));
    }

    let outcome = session(&state)?.send(&request.message).await?;
    Ok(Json(outcome))
}

/// POST /api/v1/chat/cancel
pub async fn handle_cancel(State(state): State<AppState>) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = session(&state)?.cancel();
    Ok(Json(CancelResponse { cancelled }))
}
