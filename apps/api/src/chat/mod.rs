//! Agent turns: the model reads and edits the resume through the tool surface.
//!
//! A turn appends the user's message to the transcript, then alternates between
//! asking the provider and running the tool calls it makes, until the model
//! stops asking for tools or the step budget runs out. Every message and tool
//! result is recorded in the transcript, which is also what the model is shown
//! on the next step. A provider failure ends the turn with an `error` event.

pub mod handlers;
pub mod prompts;

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentError, MessagePart, Role, Transcript, TranscriptEntry};
use crate::llm_client::{AgentEvent, ChatMessage, ChatProvider, ChatRole, ContentBlock, TOOL_USE};
use crate::tools::ToolSurface;

/// Provider round trips allowed per turn.
pub const MAX_STEPS: usize = 8;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("A chat turn is already in progress")]
    Busy,

    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub events: Vec<AgentEvent>,
    pub steps: usize,
    pub cancelled: bool,
}

/// Rebuilds the Messages API conversation from the transcript. Checkpoint
/// markers and system entries are not shown to the model; consecutive entries
/// with the same API role are merged.
pub fn to_chat_messages(entries: &[TranscriptEntry]) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::new();
    for entry in entries {
        let TranscriptEntry::Message { role, parts, .. } = entry else {
            continue;
        };
        let role = match role {
            Role::User | Role::Tool => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
            Role::System => continue,
        };
        let content: Vec<ContentBlock> = parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => ContentBlock::Text { text: text.clone() },
                MessagePart::ToolCall { id, name, input } => ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
                MessagePart::ToolResult { id, output, .. } => ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: output.clone(),
                },
            })
            .collect();
        if content.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(content),
            _ => messages.push(ChatMessage { role, content }),
        }
    }
    messages
}

/// Runs one agent turn. Cancellation is checked before every provider call
/// and races the call itself; tool calls already started always finish and
/// their effects stay.
pub async fn run_turn(
    provider: &dyn ChatProvider,
    tools: &ToolSurface,
    transcript: &Transcript,
    user_text: &str,
    cancel: &CancellationToken,
) -> Result<TurnOutcome, ChatError> {
    transcript
        .append_message(
            Role::User,
            vec![MessagePart::Text {
                text: user_text.to_string(),
            }],
        )
        .await?;

    let specs = tools.specs();
    let mut outcome = TurnOutcome {
        events: Vec::new(),
        steps: 0,
        cancelled: false,
    };

    while outcome.steps < MAX_STEPS {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        outcome.steps += 1;

        let messages = to_chat_messages(&transcript.entries().await);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Agent turn cancelled while waiting for the model");
                outcome.cancelled = true;
                return Ok(outcome);
            }
            response = provider.respond(prompts::AGENT_SYSTEM, &messages, &specs) => response,
        };
        let events = match response {
            Ok(events) => events,
            Err(e) => {
                warn!("Agent step {} failed: {e}", outcome.steps);
                outcome.events.push(AgentEvent::Error {
                    message: e.to_string(),
                });
                return Ok(outcome);
            }
        };

        let mut parts = Vec::new();
        let mut calls = Vec::new();
        let mut finish = None;
        for event in events {
            match &event {
                AgentEvent::TextDelta { text } => {
                    parts.push(MessagePart::Text { text: text.clone() });
                }
                AgentEvent::ToolCall { id, name, input } => {
                    parts.push(MessagePart::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    calls.push((id.clone(), name.clone(), input.clone()));
                }
                AgentEvent::Finish { reason } => finish = Some(reason.clone()),
                AgentEvent::ReasoningDelta { .. }
                | AgentEvent::ToolResult { .. }
                | AgentEvent::Error { .. } => {}
            }
            outcome.events.push(event);
        }
        transcript.append_message(Role::Assistant, parts).await?;

        if calls.is_empty() || finish.as_deref() != Some(TOOL_USE) {
            debug!("Agent turn finished after {} steps", outcome.steps);
            return Ok(outcome);
        }

        let mut results = Vec::with_capacity(calls.len());
        for (id, name, input) in calls {
            let output = tools.dispatch(&name, &input).await;
            debug!(tool = %name, %output, "tool call finished");
            outcome.events.push(AgentEvent::ToolResult {
                id: id.clone(),
                name: name.clone(),
                output: output.clone(),
            });
            results.push(MessagePart::ToolResult { id, name, output });
        }
        transcript.append_message(Role::Tool, results).await?;
    }

    warn!("Agent turn stopped at the {MAX_STEPS}-step limit");
    outcome.events.push(AgentEvent::Finish {
        reason: "max_steps".to_string(),
    });
    Ok(outcome)
}

/// One conversation over the document. At most one turn runs at a time.
pub struct ChatSession {
    provider: Arc<dyn ChatProvider>,
    tools: ToolSurface,
    document: Arc<Document>,
    turn: tokio::sync::Mutex<()>,
    current: Mutex<CancellationToken>,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn ChatProvider>, tools: ToolSurface, document: Arc<Document>) -> Self {
        Self {
            provider,
            tools,
            document,
            turn: tokio::sync::Mutex::new(()),
            current: Mutex::new(CancellationToken::new()),
        }
    }

    /// Runs a turn, or fails with `Busy` when one is already running.
    pub async fn send(&self, text: &str) -> Result<TurnOutcome, ChatError> {
        let Ok(_turn) = self.turn.try_lock() else {
            return Err(ChatError::Busy);
        };
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        run_turn(
            self.provider.as_ref(),
            &self.tools,
            self.document.transcript(),
            text,
            &token,
        )
        .await
    }

    /// Keeps new turns out while the guard lives. Fails with `Busy` while a
    /// turn runs, so checkpoint markers never land between a tool call and
    /// its result.
    pub fn pause(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, ChatError> {
        self.turn.try_lock().map_err(|_| ChatError::Busy)
    }

    /// Cancels the running turn. Returns false when no turn is running.
    pub fn cancel(&self) -> bool {
        if self.turn.try_lock().is_ok() {
            return false;
        }
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        true
    }
}
