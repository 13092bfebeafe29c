//! # Templates (§4.2)
//!
//! Workflow authors embed JSONata expressions wherever a value must be
//! computed from the current exchange: `stepTemplate`, credential
//! templates, and `openId.createAuthorizationRequest`. JSONata evaluation
//! itself is an external collaborator (§1 Non-goals) — this module defines
//! the template's on-the-wire shape and the [`TemplateEvaluator`] trait the
//! engine evaluates it through, so callers can plug in a real JSONata
//! engine (or a fake, for tests) without this crate depending on one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::invalid;

/// A template tagged with its expression language. Currently only
/// `"jsonata"` is defined; the tag is kept so a future language can be
/// added without breaking the wire format.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TypedTemplate {
    /// A [JSONata](https://jsonata.org) expression.
    Jsonata {
        /// The expression source.
        template: String,
    },
}

impl TypedTemplate {
    /// The expression source, regardless of template language.
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Jsonata { template } => template,
        }
    }
}

/// Evaluates a [`TypedTemplate`] against an input document.
///
/// Implementations own the actual expression engine. The engine calls this
/// trait in two shapes (§4.2): `evaluateTemplate`, which evaluates a
/// template against an arbitrary scope and returns whatever JSON value
/// results, and `evaluateExchangeStep`, which evaluates a `stepTemplate`
/// against the exchange and additionally requires the result to parse as a
/// [`crate::workflow::Step`].
pub trait TemplateEvaluator: Send + Sync {
    /// Evaluates `template` against `scope`, returning the raw JSONata
    /// result.
    ///
    /// # Errors
    /// Returns [`crate::Error::DataError`] if the template fails to parse or
    /// evaluate.
    async fn evaluate(&self, template: &TypedTemplate, scope: &Value) -> Result<Value>;
}

/// Evaluates `template` against `scope` via `evaluator` (§4.2
/// `evaluateTemplate`).
///
/// # Errors
/// Propagates the evaluator's error.
pub async fn evaluate_template(
    evaluator: &dyn TemplateEvaluator,
    template: &TypedTemplate,
    scope: &Value,
) -> Result<Value> {
    evaluator.evaluate(template, scope).await
}

/// Evaluates a `stepTemplate` against `scope` and parses the result as a
/// [`crate::workflow::Step`] (§4.2 `evaluateExchangeStep`).
///
/// # Errors
/// Returns [`crate::Error::DataError`] if evaluation fails or the result
/// does not parse as a step.
pub async fn evaluate_exchange_step(
    evaluator: &dyn TemplateEvaluator,
    template: &TypedTemplate,
    scope: &Value,
) -> Result<crate::workflow::Step> {
    let value = evaluate_template(evaluator, template, scope).await?;
    let is_non_empty_object = value.as_object().is_some_and(|map| !map.is_empty());
    if !is_non_empty_object {
        return Err(invalid!("stepTemplate must evaluate to a non-empty object"));
    }
    serde_json::from_value(value).map_err(|e| invalid!("stepTemplate did not evaluate to a step: {e}"))
}

/// Sets `path` (a dotted variable path) to `value` within `scope`,
/// creating intermediate objects as needed (§4.2 `setVariable`, used by the
/// issuance engine's `result` field and by `invalidate`'s error recording).
///
/// # Errors
/// Returns [`crate::Error::DataError`] if an intermediate segment of `path`
/// already holds a non-object value.
pub fn set_variable(scope: &mut Value, path: &str, value: Value) -> Result<()> {
    if !scope.is_object() {
        *scope = Value::Object(serde_json::Map::new());
    }
    let mut segments = path.split('.').peekable();
    let mut cursor = scope;
    while let Some(segment) = segments.next() {
        let Some(map) = cursor.as_object_mut() else {
            return Err(invalid!("variable path '{path}' traverses a non-object value"));
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Ok(())
}
