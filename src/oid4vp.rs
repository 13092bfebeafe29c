//! # OID4VP Adapter (C9, §4.9)
//!
//! Drives the [OpenID for Verifiable Presentations](https://openid.net/specs/openid-4-verifiable-presentations-1_0.html)
//! side of a step: building (or replaying) the authorization request a
//! wallet fetches, and processing the authorization response it posts
//! back. Unlike the VC-API and OID4VCI adapters, this one owns the only
//! CAS-retry loop in the engine (§4.9 step 3) — a conflict here just means
//! two concurrent requests both tried to activate the same exchange, and
//! retrying is cheap and safe.

pub mod request;
pub mod response;

use serde_json::Value;
use tracing::instrument;

use crate::capability::CapabilityClient;
use crate::config::EngineConfig;
use crate::exchange::store::Store;
use crate::template::TemplateEvaluator;
use crate::workflow::Workflow;
use crate::Result;

pub use request::get_authorization_request;
pub use response::{
    process_authorization_response, AuthorizationResponseBody, AuthorizationResponseOutcome, ResponseDecryptor,
};

/// Handles `GET <exchangePath>/authorization/request[/<clientProfileId>]`
/// (§4.9 `getAuthorizationRequest`).
#[instrument(level = "debug", skip(store, evaluator))]
pub async fn handle_get_authorization_request(
    workflow: &Workflow,
    config: &EngineConfig,
    workflow_id: &str,
    store: &impl Store,
    evaluator: &impl TemplateEvaluator,
    exchange_id: &str,
    exchange_path: &str,
    client_profile_id: Option<&str>,
) -> Result<Value> {
    get_authorization_request(
        workflow,
        config,
        workflow_id,
        store,
        evaluator,
        exchange_id,
        exchange_path,
        client_profile_id,
    )
    .await
}

/// Handles `POST <exchangePath>/authorization/response[/<clientProfileId>]`
/// (§4.9 `processAuthorizationResponse`).
#[allow(clippy::too_many_arguments)]
#[instrument(level = "debug", skip(store, evaluator, capability_client, resolver, decryptor))]
pub async fn handle_authorization_response(
    workflow: &Workflow,
    config: &EngineConfig,
    workflow_id: &str,
    store: &impl Store,
    evaluator: &impl TemplateEvaluator,
    capability_client: &impl CapabilityClient,
    resolver: &(impl credibil_did::DidResolver + Clone),
    decryptor: Option<&impl ResponseDecryptor>,
    exchange_id: &str,
    exchange_path: &str,
    client_profile_id: Option<&str>,
    body: &AuthorizationResponseBody,
) -> Result<AuthorizationResponseOutcome> {
    process_authorization_response(
        workflow,
        config,
        workflow_id,
        store,
        evaluator,
        capability_client,
        resolver,
        decryptor,
        exchange_id,
        exchange_path,
        client_profile_id,
        body,
    )
    .await
}
