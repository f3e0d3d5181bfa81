//! Remote expression evaluation.
//!
//! Expressions of the form `${...}` are resolved by an external evaluator
//! against the outputs of earlier steps in the stage.

use crate::core::StageOutput;
use crate::errors::EngineError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{[^{}]+\}").expect("expression pattern is valid"));

/// Evaluates expressions against accumulated stage output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates `expressions` on behalf of `step_id`.
    ///
    /// The result maps each expression that could be resolved to its value.
    /// Expressions absent from the result were not resolved.
    async fn evaluate(
        &self,
        step_id: &str,
        expressions: &[String],
        stage_output: &StageOutput,
    ) -> Result<HashMap<String, String>, EngineError>;
}

/// Which expressions are forwarded to the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Send every expression as-is.
    SkipCondition,
    /// Send only expressions matching the `${...}` pattern.
    Embedded,
}

/// Returns true if `text` contains at least one `${...}` expression.
#[must_use]
pub fn is_jexl(text: &str) -> bool {
    EXPRESSION.is_match(text)
}

/// Returns every `${...}` expression in `text`, in order, without duplicates.
#[must_use]
pub fn find_expressions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in EXPRESSION.find_iter(text) {
        if !found.iter().any(|e| e == m.as_str()) {
            found.push(m.as_str().to_string());
        }
    }
    found
}

/// Resolves `expressions`, filtering them according to `mode`.
///
/// No remote call is made when nothing is left to send.
pub async fn resolve_expressions(
    evaluator: &dyn ExpressionEvaluator,
    step_id: &str,
    expressions: &[String],
    stage_output: &StageOutput,
    mode: ResolveMode,
) -> Result<HashMap<String, String>, EngineError> {
    let to_send: Vec<String> = match mode {
        ResolveMode::SkipCondition => expressions.to_vec(),
        ResolveMode::Embedded => expressions.iter().filter(|e| is_jexl(e)).cloned().collect(),
    };
    if to_send.is_empty() {
        return Ok(HashMap::new());
    }
    evaluator.evaluate(step_id, &to_send, stage_output).await
}

/// Substitutes every resolvable `${...}` expression embedded in `text`.
///
/// Expressions the evaluator does not return are left verbatim.
pub async fn resolve_embedded(
    evaluator: &dyn ExpressionEvaluator,
    step_id: &str,
    text: &str,
    stage_output: &StageOutput,
) -> Result<String, EngineError> {
    let expressions = find_expressions(text);
    if expressions.is_empty() {
        return Ok(text.to_string());
    }

    let resolved =
        resolve_expressions(evaluator, step_id, &expressions, stage_output, ResolveMode::Embedded)
            .await?;

    let mut out = text.to_string();
    for expr in &expressions {
        if let Some(value) = resolved.get(expr) {
            out = out.replace(expr.as_str(), value);
        }
    }
    Ok(out)
}
