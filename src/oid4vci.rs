//! # OID4VCI Adapter (C8, §4.8)
//!
//! Exposes a *virtual* OAuth 2.0 authorization server and credential issuer
//! for each exchange: metadata documents, a pre-authorized-code token
//! endpoint, the credential/batch-credential endpoint, and the
//! credential-offer/nonce endpoints. Every endpoint is keyed off one
//! exchange; there is no issuer-wide state.

pub mod credential;
pub mod metadata;
pub mod offer;
pub mod token;

use tracing::instrument;

use crate::capability::CapabilityClient;
use crate::config::EngineConfig;
use crate::exchange::store::Store;
use crate::exchange::State;
use crate::invalid;
use crate::processor::get_step;
use crate::template::TemplateEvaluator;
use crate::workflow::Workflow;
use crate::Result;

pub use credential::{CredentialOutcome, CredentialRequest, InvalidOrMissingProof, PresentationRequired, Proof};
pub use offer::{CredentialOfferResponse, NonceResponse};
pub use token::{AccessTokenClaims, TokenRequest};

/// Handles `POST <exchangePath>/openid/token` (§4.8 "Token endpoint").
///
/// # Errors
/// See [`token::process_token_request`].
#[instrument(level = "debug", skip(store))]
pub async fn handle_token_request(
    config: &EngineConfig,
    workflow_id: &str,
    store: &impl Store,
    exchange_id: &str,
    request: &TokenRequest,
) -> Result<crate::oauth::TokenResponse> {
    let record = store.get(workflow_id, exchange_id, false).await?;
    token::process_token_request(config, &record.exchange, record.meta.expires, request).await
}

/// Handles `POST <exchangePath>/openid/credential` and `.../batch_credential`
/// (§4.8 "Credential / batch-credential endpoint").
///
/// `bearer_token` is the access token from the `Authorization: Bearer` header,
/// already stripped of its scheme prefix by the caller. On successful
/// issuance the exchange is persisted `complete` and the issued credentials
/// are returned directly, rather than a [`crate::processor::ProcessOutcome`]
/// — this endpoint's completion shape doesn't go through the generic
/// processor loop since issuance here is driven by the holder's proof, not
/// a VC-API presentation.
///
/// # Errors
/// Returns [`crate::Error::NotAllowed`] if `bearer_token` doesn't verify
/// against the exchange. See [`credential::process_credential_requests`]
/// for the remaining failure modes.
#[allow(clippy::too_many_arguments)]
#[instrument(level = "debug", skip(store, evaluator, capability_client, resolver))]
pub async fn handle_credential_request(
    workflow: &Workflow,
    workflow_id: &str,
    config: &EngineConfig,
    store: &impl Store,
    evaluator: &impl TemplateEvaluator,
    capability_client: &impl CapabilityClient,
    resolver: &(impl credibil_did::DidResolver + Clone),
    exchange_id: &str,
    bearer_token: &str,
    requests: &[CredentialRequest],
) -> Result<CredentialOutcome> {
    let mut record = store.get(workflow_id, exchange_id, false).await?;
    token::verify_access_token(&record.exchange, bearer_token).await?;

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

    let outcome = credential::process_credential_requests(
        workflow,
        workflow_id,
        config,
        &step,
        &step_name,
        &mut record.exchange,
        requests,
        resolver,
        evaluator,
        capability_client,
    )
    .await?;

    if matches!(outcome, CredentialOutcome::Issued(_)) {
        record.exchange.state = State::Complete;
        record.exchange.sequence += 1;
        store.complete(workflow_id, record.exchange.clone()).await?;
    }

    Ok(outcome)
}

/// Builds the well-known metadata document URL derived from an exchange
/// path (§4.8 "Credential / batch-credential endpoint": "`issuerConfigUrl`
/// derived from the same exchange-id").
#[must_use]
pub fn issuer_config_url(exchange_path: &str) -> String {
    format!("{exchange_path}/.well-known/openid-credential-issuer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_config_url_is_well_known_suffix() {
        assert_eq!(
            issuer_config_url("https://issuer.example/w/1/exchanges/z1"),
            "https://issuer.example/w/1/exchanges/z1/.well-known/openid-credential-issuer"
        );
    }
}
