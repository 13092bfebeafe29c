//! # VC-API Adapter (C7, §4.7)
//!
//! Translates the [VC-API](https://w3c-ccg.github.io/vc-api/) exchange
//! protocol — `POST <exchangePath>` with an optional received presentation,
//! get back either a presentation request or the result — onto
//! [`crate::processor::Processor`].

use base64ct::Encoding;
use jsonschema::validator_for;
use serde_json::{json, Value};
use tracing::instrument;

use crate::capability::CapabilityClient;
use crate::config::EngineConfig;
use crate::exchange::store::Store;
use crate::exchange::ExchangeRecord;
use crate::processor::{get_step, ProcessOutcome, Processor};
use crate::template::TemplateEvaluator;
use crate::verify;
use crate::w3c_vc::Enveloped;
use crate::workflow::{Step, Workflow};
use crate::{invalid, operation, Result};

/// Whether `step` supports the VC-API protocol (§4.7 "Pre-conditions").
#[must_use]
pub fn supports_vcapi(workflow: &Workflow, step: &Step) -> bool {
    step.supports_vcapi(workflow)
}

/// Drives one VC-API request through the processor (§4.7).
///
/// `create_challenge` mints a fresh challenge via the workflow's
/// `createChallenge` capability when the resolved step asks for one on a
/// non-initial step; on the initial step the challenge is always
/// `exchange.id`.
///
/// # Errors
/// Returns [`crate::Error::NotSupported`] if the current step doesn't
/// support VC-API, or any error the processor/verification pipeline raises.
#[instrument(level = "debug", skip(store, evaluator, capability_client, resolver))]
pub async fn process_vcapi_request(
    workflow: &Workflow,
    config: &EngineConfig,
    workflow_id: &str,
    store: &impl Store,
    evaluator: &impl TemplateEvaluator,
    capability_client: &impl CapabilityClient,
    resolver: &(impl credibil_did::DidResolver + Clone),
    mut record: ExchangeRecord,
    received_presentation: Option<Value>,
) -> Result<ProcessOutcome> {
    let is_initial_step = record.exchange.step.is_none();
    let step_name = record
        .exchange
        .step
        .clone()
        .or_else(|| workflow.initial_step.clone())
        .ok_or_else(|| invalid!("workflow has no initialStep"))?;

    let globals = record.exchange.globals(workflow_id);
    let mut scope = record.exchange.variables.clone();
    if let Some(map) = scope.as_object_mut() {
        map.insert("globals".to_string(), globals);
    }
    let step = get_step(workflow, &step_name, &scope, evaluator).await?;
    if !supports_vcapi(workflow, &step) {
        return Err(crate::Error::NotSupported("step does not support VC-API".to_string()));
    }

    let challenge = if step.create_challenge {
        Some(if is_initial_step {
            record.exchange.id.clone()
        } else {
            mint_challenge(workflow, capability_client).await?
        })
    } else {
        None
    };

    if let Some(presentation) = &received_presentation {
        validate_received_presentation(&step, presentation)?;

        let expected_challenge = challenge.as_deref().unwrap_or(&record.exchange.id);
        let zcap = workflow
            .zcaps
            .get("verifyPresentation")
            .ok_or_else(|| invalid!("workflow has no 'verifyPresentation' zcap"))?;
        let verify_params = verify::VerifyPresentationParams {
            workflow_id,
            vpr: step.verifiable_presentation_request.as_ref(),
            allow_unprotected_presentation: step.allow_unprotected_presentation,
            verify_presentation_options: step.verify_presentation_options.as_ref(),
            verify_presentation_result_schema: step.verify_presentation_result_schema.as_ref(),
            expected_challenge: Some(expected_challenge),
        };
        let verify_result =
            verify::verify_presentation(capability_client, zcap, presentation, &verify_params).await?;

        let verification_method =
            verify_result.pointer("/presentationResult/results/0/verificationMethod").cloned();
        let did = match verification_method.as_ref().and_then(Value::as_str) {
            Some(vm_id) => resolve_controller(resolver, vm_id).await,
            None => None,
        };

        let result_entry = json!({
            "did": did,
            "verificationMethod": verification_method,
            "verifiablePresentation": presentation,
            "verifyPresentationResults": verify_result,
        });
        crate::template::set_variable(&mut record.exchange.variables, &format!("results.{step_name}"), result_entry)?;
    }

    let input_required = |s: &Step, received: Option<&Value>| {
        s.verifiable_presentation_request.is_some() && received.is_none()
    };
    let processor = Processor::new(workflow, config, input_required);
    let mut outcome = processor
        .process(workflow_id, store, evaluator, capability_client, record, received_presentation)
        .await?;

    if let Some(challenge) = &challenge
        && let Some(vpr) = &mut outcome.verifiable_presentation_request
        && let Some(map) = vpr.as_object_mut()
    {
        map.insert("challenge".to_string(), json!(challenge));
    }

    Ok(outcome)
}

/// Resolves `vm_id` to its controller DID, for building the `did` field of
/// a VC-API result (§4.7 "Received presentation handling"). Returns `None`
/// if resolution fails rather than failing the whole request — the result
/// still carries `verificationMethod` for the caller to inspect.
pub(crate) async fn resolve_controller(
    resolver: &(impl credibil_did::DidResolver + Clone),
    vm_id: &str,
) -> Option<String> {
    let deref = credibil_did::dereference(vm_id, None, resolver.clone()).await.ok()?;
    match deref.content_stream {
        Some(credibil_did::Resource::VerificationMethod(vm)) => Some(vm.controller),
        _ => None,
    }
}

/// Mints a fresh challenge via the workflow's `createChallenge` capability
/// (§4.7 "VPR challenge policy", subsequent steps).
async fn mint_challenge(workflow: &Workflow, capability_client: &impl CapabilityClient) -> Result<String> {
    let zcap = workflow
        .zcaps
        .get("createChallenge")
        .ok_or_else(|| invalid!("workflow has no 'createChallenge' zcap"))?;
    let response = capability_client
        .invoke(zcap, None, &json!({}))
        .await
        .map_err(|e| operation!("createChallenge capability invocation failed: {e}"))?;
    response
        .get("challenge")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| operation!("createChallenge capability did not return a challenge"))
}

/// Validates a received presentation's contents against
/// `step.presentationSchema`, un-enveloping an `EnvelopedVerifiablePresentation`
/// first (§4.7 "Received presentation handling").
///
/// # Errors
/// Returns [`crate::Error::DataError`] if the presentation fails schema
/// validation.
pub fn validate_received_presentation(step: &Step, presentation: &Value) -> Result<()> {
    let Some(schema) = &step.presentation_schema else {
        return Ok(());
    };

    let contents = unenvelope(presentation);
    let validator = validator_for(&schema.json_schema)
        .map_err(|e| invalid!("invalid presentationSchema: {e}"))?;
    if let Err(e) = validator.validate(&contents) {
        return Err(invalid!("received presentation failed schema validation: {e}"));
    }
    Ok(())
}

/// Strips an `EnvelopedVerifiablePresentation` wrapper down to the
/// unwrapped content when present; returns `value` unchanged otherwise
/// (§4.7, §4.9 step 3).
///
/// A JWT-enveloped presentation carries its contents in the token's
/// payload segment (the `vp` claim); anything else is returned as-is for
/// the caller to validate directly.
#[must_use]
pub fn unenvelope(value: &Value) -> Value {
    let Ok(enveloped) = serde_json::from_value::<Enveloped>(value.clone()) else {
        return value.clone();
    };
    if enveloped.type_ != "EnvelopedVerifiablePresentation" {
        return value.clone();
    }
    let Some(token) = enveloped.token() else {
        return value.clone();
    };
    let Some(payload_b64) = token.split('.').nth(1) else {
        return value.clone();
    };
    let Ok(bytes) = base64ct::Base64UrlUnpadded::decode_vec(payload_b64) else {
        return value.clone();
    };
    let Ok(claims) = serde_json::from_slice::<Value>(&bytes) else {
        return value.clone();
    };
    claims.get("vp").cloned().unwrap_or(claims)
}
