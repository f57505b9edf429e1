//! The query/mutate tool pair offered to the agent.
//!
//! Both tools take a single jq-style expression. Every failure (bad syntax,
//! schema mismatch, failed build) collapses into the opaque `"Failed"` reply;
//! the detail goes to the log, and the agent is expected to re-query and try
//! again.

pub mod handlers;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::document::{Document, DocumentError};
use crate::expr::{self, ExprLimits};
use crate::models::ResumeData;

pub const QUERY_TOOL: &str = "query";
pub const MUTATE_TOOL: &str = "mutate";

pub const SUCCESS: &str = "Success";
pub const FAILED: &str = "Failed";

/// Tool description in the shape the Messages API expects.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

fn expression_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": description
            }
        },
        "required": ["query"]
    })
}

#[derive(Clone)]
pub struct ToolSurface {
    document: Arc<Document>,
    limits: ExprLimits,
    evaluations: Arc<Semaphore>,
}

impl ToolSurface {
    pub fn new(document: Arc<Document>, limits: ExprLimits) -> Self {
        Self {
            document,
            limits,
            evaluations: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: QUERY_TOOL,
                description: "Read the resume. Runs a jq expression against the resume JSON \
                              and returns the results as compact JSON, one per line. \
                              Returns \"Failed\" if the expression is invalid.",
                input_schema: expression_schema("jq expression, e.g. .work[0].positions"),
            },
            ToolSpec {
                name: MUTATE_TOOL,
                description: "Change the resume. Runs a jq expression that must produce exactly \
                              one value: the complete new resume. Returns \"Success\" when the \
                              change was saved and the resume still builds, otherwise \"Failed\" \
                              and nothing is changed.",
                input_schema: expression_schema(
                    "jq update expression, e.g. .personal.name = \"Jane Doe\"",
                ),
            },
        ]
    }

    /// Runs a tool by name. Unknown names and arguments without a string
    /// `query` are failures.
    pub async fn dispatch(&self, name: &str, args: &Value) -> String {
        let Some(expression) = args.get("query").and_then(Value::as_str) else {
            warn!(tool = name, %args, "tool call without a query argument");
            return FAILED.to_string();
        };
        match name {
            QUERY_TOOL => self.query(expression).await,
            MUTATE_TOOL => self.mutate(expression).await,
            other => {
                warn!(tool = other, "unknown tool");
                FAILED.to_string()
            }
        }
    }

    pub async fn query(&self, expression: &str) -> String {
        match self.try_query(expression).await {
            Ok(result) => result,
            Err(e) => {
                warn!(expression, error = %e, "query failed");
                FAILED.to_string()
            }
        }
    }

    pub async fn mutate(&self, expression: &str) -> String {
        match self.try_mutate(expression).await {
            Ok(()) => {
                debug!(expression, "mutation applied");
                SUCCESS.to_string()
            }
            Err(e) => {
                warn!(expression, error = %e, "mutation failed");
                FAILED.to_string()
            }
        }
    }

    async fn try_query(&self, expression: &str) -> Result<String, DocumentError> {
        let input = self.document.get_data()?.to_json()?;
        let outputs = self.evaluate(expression, input).await?;
        Ok(expr::render_outputs(&outputs))
    }

    async fn try_mutate(&self, expression: &str) -> Result<(), DocumentError> {
        let guard = self.document.begin_mutation().await?;
        let input = guard.current().to_json()?;
        let mut outputs = self.evaluate(expression, input).await?;

        let failed = |reason: String| DocumentError::ExpressionFailed {
            expression: expression.to_string(),
            reason,
        };
        if outputs.len() != 1 {
            return Err(failed(format!(
                "expected exactly one output, got {}",
                outputs.len()
            )));
        }
        let value = outputs
            .pop()
            .ok_or_else(|| failed("expression produced no output".to_string()))?;
        let data = ResumeData::from_json(value)
            .map_err(|e| failed(format!("result does not match the resume schema: {e}")))?;

        guard.commit(data).await
    }

    /// Evaluates on a blocking thread. One evaluation runs at a time and
    /// holds its permit until the thread finishes, so a timed-out expression
    /// that is still winding down blocks the next one instead of piling up.
    async fn evaluate(&self, expression: &str, input: Value) -> Result<Vec<Value>, DocumentError> {
        let failed = |reason: String| DocumentError::ExpressionFailed {
            expression: expression.to_string(),
            reason,
        };
        let limits = self.limits;
        let permit = tokio::time::timeout(limits.timeout, self.evaluations.clone().acquire_owned())
            .await
            .map_err(|_| failed("another evaluation is still running".to_string()))?
            .map_err(|e| failed(format!("evaluation slot unavailable: {e}")))?;

        let src = expression.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            expr::evaluate(&src, &input, &limits)
        });
        let outcome = tokio::time::timeout(limits.timeout, task)
            .await
            .map_err(|_| failed(format!("evaluation did not finish within {:?}", limits.timeout)))?
            .map_err(|e| failed(format!("evaluation task failed: {e}")))?;
        outcome.map_err(|e| failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::testing::FAIL_MARKER;
    use crate::document::testing::{loaded_document, ready_document};
    use crate::document::{DocumentEvent, DocumentObserver};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn surface_with(name: &str) -> (crate::document::testing::Harness, ToolSurface) {
        let harness = ready_document().await;
        harness
            .document
            .set_data(ResumeData::named(name))
            .await
            .unwrap();
        let tools = ToolSurface::new(harness.document.clone(), ExprLimits::default());
        (harness, tools)
    }

    #[tokio::test]
    async fn test_successful_mutation_updates_name_and_renders_once() {
        let (harness, tools) = surface_with("John Doe").await;
        let renders_before = harness.loader.engine().renders();

        let reply = tools.mutate(r#".personal.name = "Jane Doe""#).await;

        assert_eq!(reply, SUCCESS);
        assert_eq!(tools.query(".personal.name").await, r#""Jane Doe""#);
        assert_eq!(harness.loader.engine().renders(), renders_before + 1);
    }

    #[tokio::test]
    async fn test_mutation_producing_a_non_document_fails_without_change() {
        let (harness, tools) = surface_with("John Doe").await;
        let before = harness.document.get_data().unwrap();

        assert_eq!(tools.mutate(r#""not json""#).await, FAILED);
        assert_eq!(harness.document.get_data().unwrap(), before);
    }

    #[tokio::test]
    async fn test_mutation_failures_are_opaque() {
        let (harness, tools) = surface_with("John Doe").await;
        let before = harness.document.get_data().unwrap();

        let breaks_build = format!(".personal.name = \"{FAIL_MARKER}\"");
        for expression in [
            ".personal.name = ",
            ".unknownSection = 1",
            ".personal.name = (\"A\", \"B\")",
            "empty",
            breaks_build.as_str(),
        ] {
            assert_eq!(tools.mutate(expression).await, FAILED, "{expression}");
        }
        assert_eq!(harness.document.get_data().unwrap(), before);
    }

    #[tokio::test]
    async fn test_query_never_notifies_observers() {
        let (harness, tools) = surface_with("John Doe").await;
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let observer: Arc<dyn DocumentObserver> = Arc::new(move |_: &DocumentEvent| {
            handle.fetch_add(1, Ordering::SeqCst);
        });
        harness.document.subscribe(observer);

        assert_eq!(tools.query(".personal.name = \"X\" | .personal.name").await, r#""X""#);
        assert_eq!(tools.query(".personal.name").await, r#""John Doe""#);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_query_reports_failed_on_bad_expression() {
        let (_harness, tools) = surface_with("John Doe").await;
        assert_eq!(tools.query(".personal.name |").await, FAILED);
        assert_eq!(tools.query("frobnicate(.)").await, FAILED);
        assert_eq!(tools.query(&format!(".{}", "a".repeat(5000))).await, FAILED);
    }

    #[tokio::test]
    async fn test_runaway_query_times_out_and_frees_the_slot() {
        let (harness, _) = surface_with("John Doe").await;
        let tools = ToolSurface::new(
            harness.document.clone(),
            ExprLimits {
                max_outputs: usize::MAX,
                timeout: std::time::Duration::from_millis(50),
                ..ExprLimits::default()
            },
        );

        assert_eq!(tools.query("range(1e12)").await, FAILED);
        assert_eq!(tools.query(".personal.name").await, r#""John Doe""#);
    }

    #[tokio::test]
    async fn test_query_works_before_compiler_is_loaded() {
        let harness = loaded_document().await;
        let tools = ToolSurface::new(harness.document.clone(), ExprLimits::default());
        assert_eq!(tools.query(".personal.name").await, r#""Add Your Name""#);
        assert_eq!(tools.mutate(".personal.name = \"X\"").await, FAILED);
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_name() {
        let (_harness, tools) = surface_with("John Doe").await;
        let args = json!({"query": ".personal.name"});
        assert_eq!(tools.dispatch(QUERY_TOOL, &args).await, r#""John Doe""#);
        assert_eq!(tools.dispatch("delete_everything", &args).await, FAILED);
        assert_eq!(tools.dispatch(QUERY_TOOL, &json!({"q": "."})).await, FAILED);
        assert_eq!(
            tools
                .dispatch(MUTATE_TOOL, &json!({"query": ".interests = [\"Go\"]"}))
                .await,
            SUCCESS
        );
    }

    #[tokio::test]
    async fn test_specs_expose_both_tools() {
        let (_harness, tools) = surface_with("John Doe").await;
        let specs = tools.specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name).collect();
        assert_eq!(names, vec![QUERY_TOOL, MUTATE_TOOL]);
        assert_eq!(specs[1].input_schema["required"], json!(["query"]));
    }
}
