pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::chat::handlers as chat;
use crate::document::handlers as document;
use crate::state::AppState;
use crate::tools::handlers as tools;
use crate::vfs::handlers as files;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Document
        .route(
            "/api/v1/document",
            get(document::handle_get_document).put(document::handle_put_document),
        )
        .route(
            "/api/v1/document/readiness",
            get(document::handle_readiness),
        )
        .route(
            "/api/v1/document/compiler/load",
            post(document::handle_load_compiler),
        )
        .route("/api/v1/document/preview", get(document::handle_preview))
        .route("/api/v1/document/export", get(document::handle_export))
        .route("/api/v1/document/store", delete(document::handle_reset))
        .route("/api/v1/document/events", get(document::handle_events))
        // Files
        .route("/api/v1/files", get(files::handle_list_files))
        .route("/api/v1/files/*path", get(files::handle_read_file))
        // Checkpoints
        .route(
            "/api/v1/checkpoints",
            get(document::handle_list_checkpoints).post(document::handle_create_checkpoint),
        )
        .route(
            "/api/v1/checkpoints/:id/restore",
            post(document::handle_restore_checkpoint),
        )
        .route("/api/v1/transcript", get(document::handle_transcript))
        // Tools
        .route("/api/v1/tools", get(tools::handle_list_tools))
        .route("/api/v1/tools/query", post(tools::handle_query))
        .route("/api/v1/tools/mutate", post(tools::handle_mutate))
        // Chat
        .route("/api/v1/chat", post(chat::handle_chat))
        .route("/api/v1/chat/cancel", post(chat::handle_cancel))
        .with_state(state)
}
