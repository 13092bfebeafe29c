//! # Exchange Processor (§4.6) — core state machine
//!
//! [`Processor::process`] runs one pass over an exchange's current step:
//! resolving it (static or template-produced), deciding whether client
//! input is still required, running issuance, and persisting the result.
//! It is the engine the VC-API adapter (§4.7) drives directly; the OID4VCI
//! and OID4VP adapters (§4.8, §4.9) reuse its building blocks —
//! [`get_step`], [`issuance`] — but manage their own narrower completion
//! logic instead of the generic loop.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::capability::CapabilityClient;
use crate::config::EngineConfig;
use crate::exchange::store::Store;
use crate::exchange::{Exchange, ExchangeRecord, Meta, State};
use crate::invalid;
use crate::issuance::{self, IssueRequestParams};
use crate::template::TemplateEvaluator;
use crate::w3c_vc::VerifiablePresentation;
use crate::workflow::{Step, StepOrTemplate, Workflow};
use crate::{Error, Result};

/// Result of one [`Processor::process`] pass (§4.6).
#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    /// Present when the exchange needs more input from the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifiable_presentation_request: Option<Value>,
    /// Present when the response carries a presentation (issued
    /// credentials, or a literal `step.verifiablePresentation`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifiable_presentation: Option<VerifiablePresentation>,
    /// Present once `step.redirectUrl` applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// Resolves the current step, evaluating `stepTemplate` through `evaluator`
/// if needed, and enforces the step's structural invariants (§4.6 step 4a,
/// `_getStep`).
///
/// # Errors
/// Returns [`crate::Error::DataError`] if the step is unknown, resolves to
/// a self-referential `nextStep`, or combines `nextStep` with
/// `redirectUrl`.
pub async fn get_step(
    workflow: &Workflow,
    step_name: &str,
    scope: &Value,
    evaluator: &impl TemplateEvaluator,
) -> Result<Step> {
    let entry = workflow
        .steps
        .get(step_name)
        .ok_or_else(|| invalid!("unknown step '{step_name}'"))?;
    let step = match entry {
        StepOrTemplate::Static(step) => (**step).clone(),
        StepOrTemplate::Template { step_template } => {
            crate::template::evaluate_exchange_step(evaluator, step_template, scope).await?
        }
    };
    if step.next_step.as_deref() == Some(step_name) {
        return Err(invalid!("step '{step_name}' names itself as nextStep"));
    }
    if step.next_step.is_some() && step.redirect_url.is_some() {
        return Err(invalid!("step '{step_name}' sets both nextStep and redirectUrl"));
    }
    Ok(step)
}

/// Drives one exchange through its workflow (§4.6).
///
/// `input_required` decides, for a resolved step and an optional received
/// presentation, whether the processor should pause and ask the client for
/// input rather than advance (§4.7's VC-API policy is the only caller
/// today: `step.verifiablePresentationRequest.is_some() &&
/// receivedPresentation.is_none()`).
pub struct Processor<'a, F>
where
    F: Fn(&Step, Option<&Value>) -> bool,
{
    workflow: &'a Workflow,
    config: &'a EngineConfig,
    input_required: F,
}

impl<'a, F> Processor<'a, F>
where
    F: Fn(&Step, Option<&Value>) -> bool,
{
    /// Builds a processor for `workflow`, bounded by `config`'s deadline
    /// defaults.
    pub const fn new(workflow: &'a Workflow, config: &'a EngineConfig, input_required: F) -> Self {
        Self { workflow, config, input_required }
    }

    /// Runs a single pass over `record` (§4.6).
    ///
    /// # Errors
    /// Any non-[`crate::Error::InvalidState`] error is best-effort recorded
    /// via [`Store::set_last_error`] before being returned (§4.6 step 5,
    /// §5 propagation policy).
    #[tracing::instrument(level = "debug", skip_all, fields(exchange.id = %record.exchange.id))]
    pub async fn process(
        &self,
        workflow_id: &str,
        store: &impl Store,
        evaluator: &impl TemplateEvaluator,
        capability_client: &impl CapabilityClient,
        mut record: ExchangeRecord,
        received_presentation: Option<Value>,
    ) -> Result<ProcessOutcome> {
        let result = self
            .process_inner(workflow_id, store, evaluator, capability_client, &mut record, received_presentation)
            .await;

        if let Err(err) = &result
            && !matches!(err, Error::InvalidState(_))
        {
            self.record_last_error(workflow_id, store, &record, err).await;
        }

        result
    }

    async fn process_inner(
        &self,
        workflow_id: &str,
        store: &impl Store,
        evaluator: &impl TemplateEvaluator,
        capability_client: &impl CapabilityClient,
        record: &mut ExchangeRecord,
        received_presentation: Option<Value>,
    ) -> Result<ProcessOutcome> {
        // 1. Guard.
        if record.exchange.is_terminal() {
            return Err(Error::NotAllowed("exchange is already complete or invalid".to_string()));
        }

        // 2. Activate.
        if matches!(record.exchange.state, State::Pending) {
            record.exchange.state = State::Active;
        }

        // 3. Timeout deadline.
        let deadline = deadline(&record.exchange, &record.meta, self.config);

        let mut response = ProcessOutcome::default();

        loop {
            if Utc::now() >= deadline {
                return Err(Error::Timeout("Exchange has expired.".to_string()));
            }

            let Some(step_name) = record.exchange.step.clone().or_else(|| self.workflow.initial_step.clone())
            else {
                return Err(invalid!("workflow has no initialStep and exchange has no current step"));
            };
            let globals = record.exchange.globals(workflow_id);
            let mut scope = record.exchange.variables.clone();
            if let Some(map) = scope.as_object_mut() {
                map.insert("globals".to_string(), globals);
            }

            debug!(exchange.id = %record.exchange.id, step = %step_name, "evaluating step");
            let step = get_step(self.workflow, &step_name, &scope, evaluator).await?;

            if (self.input_required)(&step, received_presentation.as_ref()) {
                return Ok(ProcessOutcome {
                    verifiable_presentation_request: step.verifiable_presentation_request.clone(),
                    ..ProcessOutcome::default()
                });
            }

            let params: Vec<IssueRequestParams> =
                issuance::get_issue_request_params(self.workflow, &record.exchange, &step)?;
            let issue_to_client = params.iter().any(|p| p.result.is_none());

            let seed = if step.verifiable_presentation.is_some() || issue_to_client {
                if response.verifiable_presentation.is_some() {
                    // a partial response already exists from a prior iteration
                    response.verifiable_presentation.clone()
                } else {
                    Some(
                        step.verifiable_presentation
                            .as_ref()
                            .map(|v| serde_json::from_value(v.clone()).unwrap_or_else(|_| VerifiablePresentation::empty()))
                            .unwrap_or_else(VerifiablePresentation::empty),
                    )
                }
            } else {
                None
            };

            let format = "application/vc";
            let outcome = issuance::issue(
                self.workflow,
                &mut record.exchange,
                evaluator,
                capability_client,
                format,
                &params,
                seed.as_ref(),
            )
            .await?;
            if outcome.verifiable_presentation.is_some() {
                response.verifiable_presentation = outcome.verifiable_presentation;
            }

            if let Some(redirect_url) = &step.redirect_url {
                response.redirect_url = Some(redirect_url.clone());
            }
            if let Some(next_step) = &step.next_step {
                response.verifiable_presentation_request = Some(serde_json::json!({}));
                record.exchange.step = Some(next_step.clone());
            } else {
                record.exchange.state = State::Complete;
            }

            record.exchange.sequence += 1;
            let persisted = if matches!(record.exchange.state, State::Complete) {
                store.complete(workflow_id, record.exchange.clone()).await
            } else {
                store.update(workflow_id, record.exchange.clone()).await
            };
            match persisted {
                Ok(updated) => *record = updated,
                Err(err) => {
                    record.exchange.sequence -= 1;
                    return Err(err);
                }
            }

            if record.exchange.state.is_terminal() || step.next_step.is_none() {
                return Ok(response);
            }
        }
    }

    async fn record_last_error(
        &self,
        workflow_id: &str,
        store: &impl Store,
        record: &ExchangeRecord,
        err: &Error,
    ) {
        let mut exchange = record.exchange.clone();
        exchange.last_error = Some(err.to_vcapi_json());

        let last_updated = Utc::now();
        if let Err(set_err) = store
            .set_last_error(
                workflow_id,
                &exchange,
                last_updated,
                self.config.last_error_rate_limit_count,
                chrono::Duration::from_std(self.config.last_error_rate_limit_window)
                    .unwrap_or(TimeDelta::zero()),
            )
            .await
        {
            warn!(exchange.id = %record.exchange.id, error = %set_err, "failed to persist lastError");
        }
    }
}

/// The scoped deadline a processing pass must complete within (§4.6 step
/// 3): the earlier of the exchange's own expiry and the configured default
/// relative to when the record was created.
#[must_use]
pub fn deadline(exchange: &Exchange, meta: &Meta, config: &EngineConfig) -> DateTime<Utc> {
    let default_deadline = meta.created
        + TimeDelta::from_std(config.processor_deadline_default).unwrap_or(TimeDelta::zero());
    exchange.expires.min(default_deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn deadline_is_earlier_of_expiry_and_default() {
        let config = EngineConfig::default();
        let now = Utc::now();
        let exchange = Exchange::builder().id("z1").expires(now + TimeDelta::hours(1)).build().unwrap();
        let meta = Meta { created: now, updated: now, expires: now + TimeDelta::hours(1) };
        let d = deadline(&exchange, &meta, &config);
        assert_eq!(d, now + TimeDelta::minutes(15));
    }

    #[tokio::test]
    async fn get_step_rejects_self_referential_next_step() {
        let mut steps = HashMap::new();
        steps.insert(
            "s1".to_string(),
            StepOrTemplate::Static(Box::new(Step { next_step: Some("s1".to_string()), ..Step::default() })),
        );
        let workflow = Workflow {
            id: "https://issuer.example/w1".to_string(),
            initial_step: Some("s1".to_string()),
            steps,
            credential_templates: Vec::new(),
            issuer_instances: Vec::new(),
            zcaps: HashMap::new(),
            oid4vp_client_profiles: None,
        };
        struct NoopEvaluator;
        impl TemplateEvaluator for NoopEvaluator {
            async fn evaluate(&self, _: &crate::template::TypedTemplate, _: &Value) -> Result<Value> {
                Ok(Value::Null)
            }
        }
        let err = get_step(&workflow, "s1", &Value::Null, &NoopEvaluator).await.unwrap_err();
        assert!(matches!(err, Error::DataError(_)));
    }
}
