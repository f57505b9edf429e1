use std::sync::Arc;

use crate::chat::ChatSession;
use crate::config::Config;
use crate::document::Document;
use crate::tools::ToolSurface;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// The one document session this process serves.
    pub document: Arc<Document>,
    pub tools: ToolSurface,
    /// `None` when no Anthropic API key is configured.
    pub chat: Option<Arc<ChatSession>>,
    pub config: Config,
}
