//! jq expressions over the resume JSON, evaluated with jaq.
//!
//! jaq has no step budget of its own, so evaluation is bounded from the
//! outside: the source length is capped, outputs are counted, and a deadline
//! is checked between outputs. The caller runs [`evaluate`] on a blocking
//! thread and enforces the same deadline around it.

use std::time::{Duration, Instant};

use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, RcIter};
use jaq_json::Val;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("expression does not parse ({0} errors)")]
    Parse(usize),

    #[error("undefined: {}", .0.join(", "))]
    Undefined(Vec<String>),

    #[error("{0}")]
    Runtime(String),

    #[error("expression produced more than {0} outputs")]
    TooManyOutputs(usize),

    #[error("expression is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("evaluation did not finish within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprLimits {
    pub max_len: usize,
    pub max_outputs: usize,
    pub timeout: Duration,
}

impl Default for ExprLimits {
    fn default() -> Self {
        Self {
            max_len: 4096,
            max_outputs: 10_000,
            timeout: Duration::from_secs(2),
        }
    }
}

/// Runs `src` against `input` with the jq standard library loaded.
pub fn evaluate(src: &str, input: &Value, limits: &ExprLimits) -> Result<Vec<Value>, ExprError> {
    if src.len() > limits.max_len {
        return Err(ExprError::TooLong {
            len: src.len(),
            max: limits.max_len,
        });
    }
    let deadline = Instant::now() + limits.timeout;

    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let modules = loader
        .load(&arena, File { code: src, path: () })
        .map_err(|errs| ExprError::Parse(errs.len()))?;
    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| {
            ExprError::Undefined(
                errs.into_iter()
                    .flat_map(|(_, undefined)| undefined)
                    .map(|(name, _)| name.to_string())
                    .collect(),
            )
        })?;

    let inputs = RcIter::new(core::iter::empty());
    let mut outputs = Vec::new();
    for output in filter.run((Ctx::new([], &inputs), Val::from(input.clone()))) {
        let value = output.map_err(|e| ExprError::Runtime(e.to_string()))?;
        if outputs.len() == limits.max_outputs {
            return Err(ExprError::TooManyOutputs(limits.max_outputs));
        }
        outputs.push(Value::from(value));
        if Instant::now() > deadline {
            return Err(ExprError::TimedOut(limits.timeout));
        }
    }
    Ok(outputs)
}

/// Compact JSON per output, one per line.
pub fn render_outputs(values: &[Value]) -> String {
    values
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn resume() -> Value {
        json!({
            "personal": {"name": "Jane Doe"},
            "work": [
                {"organization": "Acme Corp"},
                {"organization": "Globex"}
            ]
        })
    }

    fn run(src: &str) -> Result<Vec<Value>, ExprError> {
        evaluate(src, &resume(), &ExprLimits::default())
    }

    #[test]
    fn test_path_read() {
        assert_eq!(run(".personal.name").unwrap(), vec![json!("Jane Doe")]);
        assert_eq!(run(".work[].organization").unwrap().len(), 2);
        assert!(run("empty").unwrap().is_empty());
    }

    #[test]
    fn test_regex_filters() {
        assert_eq!(
            run(r#"[.work[] | select(.organization | test("^Acme")) | .organization]"#).unwrap(),
            vec![json!(["Acme Corp"])]
        );
        assert_eq!(run(r#".personal.name | test("J.ne")"#).unwrap(), vec![json!(true)]);
        assert_eq!(
            run(r#".personal.name | sub("Jane"; "John")"#).unwrap(),
            vec![json!("John Doe")]
        );
    }

    #[test]
    fn test_interpolation_variables_and_reduce() {
        assert_eq!(
            run(r#""Hello \(.personal.name)""#).unwrap(),
            vec![json!("Hello Jane Doe")]
        );
        assert_eq!(
            run(".personal as $p | $p.name").unwrap(),
            vec![json!("Jane Doe")]
        );
        assert_eq!(
            run("reduce .work[] as $w (0; . + 1)").unwrap(),
            vec![json!(2)]
        );
    }

    #[test]
    fn test_assignment_returns_whole_document() {
        let out = run(r#".personal.name = "John" | .work |= map(select(.organization != "Globex"))"#)
            .unwrap();
        assert_eq!(
            out,
            vec![json!({
                "personal": {"name": "John"},
                "work": [{"organization": "Acme Corp"}]
            })]
        );
    }

    #[test]
    fn test_parse_and_undefined_errors() {
        assert!(matches!(run(".personal.name |"), Err(ExprError::Parse(_))));
        match run("frobnicate(1)") {
            Err(ExprError::Undefined(names)) => assert_eq!(names, vec!["frobnicate"]),
            other => panic!("expected undefined, got {other:?}"),
        }
    }

    #[test]
    fn test_runtime_error() {
        assert!(matches!(run(r#"error("boom")"#), Err(ExprError::Runtime(_))));
        assert!(matches!(run(".personal.name + 1"), Err(ExprError::Runtime(_))));
    }

    #[test]
    fn test_limits() {
        let limits = ExprLimits {
            max_outputs: 5,
            ..ExprLimits::default()
        };
        assert!(matches!(
            evaluate("range(10)", &resume(), &limits),
            Err(ExprError::TooManyOutputs(5))
        ));

        let long = format!(".{}", "a".repeat(5000));
        assert!(matches!(run(&long), Err(ExprError::TooLong { .. })));
    }

    #[test]
    fn test_deadline_stops_endless_output() {
        let limits = ExprLimits {
            max_outputs: usize::MAX,
            timeout: Duration::from_millis(20),
            ..ExprLimits::default()
        };
        assert!(matches!(
            evaluate("range(1e12)", &resume(), &limits),
            Err(ExprError::TimedOut(_))
        ));
    }

    #[test]
    fn test_render_outputs_is_compact_json_lines() {
        let out = vec![json!("a"), json!({"b": [1, 2]})];
        assert_eq!(render_outputs(&out), "\"a\"\n{\"b\":[1,2]}");
    }
}
