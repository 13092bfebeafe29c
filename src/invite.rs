//! # Invite-Request Adapter (C10, §4.10)
//!
//! The simplest of the four protocol adapters: a holder posts back
//! `{url, purpose, referenceId?}` in response to an out-of-band invitation,
//! the engine records it and completes the exchange in one step — there is
//! no multi-turn state machine here, unlike VC-API/OID4VCI/OID4VP.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::exchange::store::Store;
use crate::exchange::{ExchangeRecord, State};
use crate::invalid;
use crate::processor::get_step;
use crate::template::TemplateEvaluator;
use crate::workflow::Workflow;
use crate::{Error, Result};

/// `POST <exchangePath>/invite-request/response` request body (§4.10).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteResponseRequest {
    /// The URL the holder's out-of-band invitation resolved to.
    pub url: String,
    /// The purpose the holder declares for the invitation.
    pub purpose: String,
    /// An opaque reference id, echoed back in the outcome when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

/// Outcome of [`process_invite_response`] (§4.10).
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteResponseOutcome {
    /// Echoes `request.reference_id` when the request carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

/// Handles one invite-request response (§4.10).
///
/// Requires `exchange.state == State::Pending` and a current step that
/// carries `inviteRequest`; records the response under
/// `variables.results[step].inviteRequest.inviteResponse` and completes the
/// exchange in a single atomic persistence call, so there is no partial
/// write to revert on failure — a failed `complete` leaves the store's
/// record exactly as it was before this call.
///
/// # Errors
/// Returns [`crate::Error::NotAllowed`] if the exchange isn't pending, or
/// [`crate::Error::NotSupported`] if the current step carries no
/// `inviteRequest`. Propagates the store's error on a persistence failure.
#[instrument(level = "debug", skip(store, evaluator))]
pub async fn process_invite_response(
    workflow: &Workflow,
    workflow_id: &str,
    store: &impl Store,
    evaluator: &impl TemplateEvaluator,
    record: ExchangeRecord,
    request: &InviteResponseRequest,
) -> Result<InviteResponseOutcome> {
    if !matches!(record.exchange.state, State::Pending) {
        return Err(Error::NotAllowed("exchange is not pending".to_string()));
    }

    let step_name = record
        .exchange
        .step
        .clone()
        .or_else(|| workflow.initial_step.clone())
        .ok_or_else(|| invalid!("workflow has no initialStep and exchange has no current step"))?;

    let globals = record.exchange.globals(workflow_id);
    let mut scope = record.exchange.variables.clone();
    if let Some(map) = scope.as_object_mut() {
        map.insert("globals".to_string(), globals);
    }
    let step = get_step(workflow, &step_name, &scope, evaluator).await?;
    if step.invite_request.is_none() {
        return Err(Error::NotSupported("step does not support invite-request".to_string()));
    }

    let mut exchange = record.exchange;
    let result_entry = json!({"inviteRequest": {"inviteResponse": request}});
    crate::template::set_variable(&mut exchange.variables, &format!("results.{step_name}"), result_entry)?;
    exchange.state = State::Complete;
    exchange.sequence += 1;

    store.complete(workflow_id, exchange).await?;
    Ok(InviteResponseOutcome { reference_id: request.reference_id.clone() })
}
