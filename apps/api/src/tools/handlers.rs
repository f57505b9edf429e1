//! Axum route handlers for the tool surface.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::state::AppState;
use crate::tools::ToolSpec;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExpressionRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub result: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/tools
pub async fn handle_list_tools(State(state): State<AppState>) -> Json<Vec<ToolSpec>> {
    Json(state.tools.specs())
}

/// POST /api/v1/tools/query
///
/// Evaluates a read-only expression. The result is the tool reply verbatim,
/// including `"Failed"`.
pub async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<ExpressionRequest>,
) -> Result<Json<ToolResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(AppError::Validation("query cannot be empty".to_string()));
    }

    let result = state.tools.query(&request.query).await;
    Ok(Json(ToolResponse { result }))
}

/// POST /api/v1/tools/mutate
pub async fn handle_mutate(
    State(state): State<AppState>,
    Json(request): Json<ExpressionRequest>,
) -> Result<Json<ToolResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(AppError::Validation("query cannot be empty".to_string()));
    }

    let result = state.tools.mutate(&request.query).await;
    Ok(Json(ToolResponse { result }))
}
