/// LLM Client: the single point of entry for all Claude API calls.
///
/// ARCHITECTURAL RULE: No other module may call the Anthropic API directly.
/// The agent turn in `chat` talks to the model only through [`ChatProvider`].
///
/// Model: claude-sonnet-4-5 (hardcoded, do not make configurable to prevent drift)
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::tools::ToolSpec;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The model used for all LLM calls.
/// This is intentionally hardcoded to prevent accidental drift.
pub const MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 4096;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rate limited after {retries} retries")]
    RateLimited { retries: u32 },

    #[error("LLM returned empty content")]
    EmptyContent,
}

// ────────────────────────────────────────────────────────────────────────────
// Conversation types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One content block of a Messages API message, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

/// What the agent loop sees of a model response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCall { id: String, name: String, input: Value },
    ToolResult { id: String, name: String, output: String },
    Finish { reason: String },
    Error { message: String },
}

/// Finish reason that asks the caller to run tools and continue.
pub const TOOL_USE: &str = "tool_use";

/// A chat model that can call tools.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn respond(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Vec<AgentEvent>, LlmError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSpec],
}

fn no_tools(tools: &&[ToolSpec]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl LlmResponse {
    /// Converts content blocks to agent events, ending with `Finish`.
    pub fn into_events(self) -> Vec<AgentEvent> {
        let mut events: Vec<AgentEvent> = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(AgentEvent::TextDelta { text }),
                ContentBlock::Thinking { thinking, .. } => {
                    Some(AgentEvent::ReasoningDelta { text: thinking })
                }
                ContentBlock::ToolUse { id, name, input } => {
                    Some(AgentEvent::ToolCall { id, name, input })
                }
                ContentBlock::ToolResult { .. } => None,
            })
            .collect();
        events.push(AgentEvent::Finish {
            reason: self.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
        });
        events
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

/// The LLM client behind the agent.
/// Wraps the Anthropic Messages API with retry logic.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
    base_url: String,
    retry_base: Duration,
}

impl LlmClient {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(120)).build()?,
            api_key,
            base_url: ANTHROPIC_API_URL.to_string(),
            retry_base: Duration::from_secs(1),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// First backoff delay; doubles on every retry.
    #[cfg(test)]
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Makes a raw call to the Claude API, returning the full response object.
    /// Retries on 429 (rate limit) and 5xx errors with exponential backoff.
    pub async fn call(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse, LlmError> {
        let request_body = AnthropicRequest {
            model: MODEL,
            max_tokens: MAX_TOKENS,
            system,
            messages,
            tools,
        };
        let url = format!("{}/v1/messages", self.base_url);

        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s
                let delay = self.retry_base * (1 << (attempt - 1));
                warn!(
                    "LLM call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request_body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("LLM API returned {}: {}", status, body);
                last_error = Some(LlmError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                // Try to parse error message
                let message = serde_json::from_str::<AnthropicError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let body = response.text().await?;
            let llm_response: LlmResponse = serde_json::from_str(&body)?;

            debug!(
                "LLM call succeeded: input_tokens={}, output_tokens={}",
                llm_response.usage.input_tokens, llm_response.usage.output_tokens
            );

            return Ok(llm_response);
        }

        Err(last_error.unwrap_or(LlmError::RateLimited {
            retries: MAX_RETRIES,
        }))
    }
}

#[async_trait]
impl ChatProvider for LlmClient {
    async fn respond(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Vec<AgentEvent>, LlmError> {
        let response = self.call(system, messages, tools).await?;
        if response.content.is_empty() && response.stop_reason.as_deref() != Some("end_turn") {
            return Err(LlmError::EmptyContent);
        }
        Ok(response.into_events())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> LlmClient {
        LlmClient::new("test-key".to_string())
            .unwrap()
            .with_base_url(server.uri())
            .with_retry_base(Duration::from_millis(5))
    }

    fn tool_use_body() -> Value {
        json!({
            "content": [
                {"type": "thinking", "thinking": "look first", "signature": "sig"},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "query", "input": {"query": ".personal"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })
    }

    #[tokio::test]
    async fn test_respond_maps_blocks_to_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_body()))
            .expect(1)
            .mount(&server)
            .await;

        let events = client(&server)
            .respond("system", &[ChatMessage::user_text("hi")], &[])
            .await
            .unwrap();

        assert_eq!(
            events,
            vec![
                AgentEvent::ReasoningDelta {
                    text: "look first".to_string()
                },
                AgentEvent::TextDelta {
                    text: "Let me check.".to_string()
                },
                AgentEvent::ToolCall {
                    id: "toolu_1".to_string(),
                    name: "query".to_string(),
                    input: json!({"query": ".personal"}),
                },
                AgentEvent::Finish {
                    reason: TOOL_USE.to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_body()))
            .mount(&server)
            .await;

        let response = client(&server)
            .call("system", &[ChatMessage::user_text("hi")], &[])
            .await
            .unwrap();
        assert_eq!(response.stop_reason.as_deref(), Some(TOOL_USE));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"error": {"message": "bad request"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .call("system", &[ChatMessage::user_text("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 400, ref message } if message == "bad request"));
    }

    #[test]
    fn test_request_serializes_tool_results_and_omits_empty_tools() {
        let messages = vec![ChatMessage {
            role: ChatRole::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: "Success".to_string(),
            }],
        }];
        let body = serde_json::to_value(AnthropicRequest {
            model: MODEL,
            max_tokens: MAX_TOKENS,
            system: "s",
            messages: &messages,
            tools: &[],
        })
        .unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(
            body["messages"][0]["content"][0],
            json!({"type": "tool_result", "tool_use_id": "toolu_1", "content": "Success"})
        );
    }
}
