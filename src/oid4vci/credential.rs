//! # Credential / Batch-Credential Endpoint (§4.8 "Credential endpoint")

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityClient;
use crate::config::EngineConfig;
use crate::core::generate::auth_code;
use crate::exchange::{Exchange, ExpectedCredentialRequest};
use crate::issuance::IssueRequestParams;
use crate::oid4vci::token::normalize_credential_definition;
use crate::template::TemplateEvaluator;
use crate::w3c_vc::Enveloped;
use crate::workflow::{JwtDidProofRequest, Step, Workflow};
use crate::{invalid, issuance, verify, Error, Result};

/// A single entry of `credentialRequests` (batch) or the sole request body
/// (single) (§4.8).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    /// Requested format, e.g. `"jwt_vc_json"`.
    pub format: String,
    /// The `@context`/`type` shape the credential must match.
    pub credential_definition: Value,
    /// Holder's proof of possession of the intended subject key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

/// `proof` member of a [`CredentialRequest`] (§4.8, §4.4).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    /// Always `"jwt"` in the profile this engine supports.
    pub proof_type: String,
    /// The DID-proof JWT, verified per §4.4.
    pub jwt: String,
}

/// Error body returned in place of issuance when the holder hasn't yet
/// supplied a valid proof (§4.8 "invalid_or_missing_proof").
#[derive(Clone, Debug, Serialize)]
pub struct InvalidOrMissingProof {
    /// Always `"invalid_or_missing_proof"`.
    pub error: &'static str,
    /// A fresh nonce the holder should bind its next proof JWT to.
    pub c_nonce: String,
    /// Seconds until `c_nonce` expires.
    pub c_nonce_expires_in: i64,
}

/// Error body returned when the step bridges to OID4VP and no presentation
/// has been submitted yet (§4.8 "presentation_required").
#[derive(Clone, Debug, Serialize)]
pub struct PresentationRequired {
    /// Always `"presentation_required"`.
    pub error: &'static str,
    /// The authorization request the holder must complete first.
    pub authorization_request: Value,
}

/// Outcome of [`process_credential_requests`]: either issued credentials or
/// one of the two non-advancing 400 bodies (§4.8).
pub enum CredentialOutcome {
    /// Issuance succeeded; the exchange should be marked complete.
    Issued(Vec<Value>),
    /// At least one request is missing a valid proof.
    MissingProof(InvalidOrMissingProof),
    /// The step bridges to OID4VP and no presentation has landed yet.
    PresentationRequired(PresentationRequired),
}

/// Handles one call to the credential or batch-credential endpoint (§4.8
/// "Credential / batch-credential endpoint").
///
/// `authorization_request` is supplied by the caller when the step carries
/// an OID4VP bridge (`step.open_id.is_some()`) and no presentation has been
/// recorded under `variables.results[step_name].openId` yet.
///
/// # Errors
/// Returns [`crate::Error::DataError`] if the batch doesn't share one
/// format, the format isn't supported by any issuer instance, or a request
/// doesn't match any `expectedCredentialRequests` entry. Returns
/// [`crate::Error::NotAllowed`] if a supplied proof JWT fails verification.
#[allow(clippy::too_many_arguments)]
pub async fn process_credential_requests(
    workflow: &Workflow,
    workflow_id: &str,
    config: &EngineConfig,
    step: &Step,
    step_name: &str,
    exchange: &mut Exchange,
    requests: &[CredentialRequest],
    resolver: &(impl credibil_did::DidResolver + Clone),
    evaluator: &impl TemplateEvaluator,
    capability_client: &impl CapabilityClient,
) -> Result<CredentialOutcome> {
    if requests.is_empty() {
        return Err(invalid!("credential request batch is empty"));
    }

    let format = &requests[0].format;
    if requests.iter().any(|r| &r.format != format) {
        return Err(invalid!("all requests in a batch must share one format"));
    }
    if workflow.issue_zcap_for_format(format).is_none() {
        return Err(invalid!("format '{format}' is not supported by any issuer instance"));
    }

    for request in requests {
        let mut definition = request.credential_definition.clone();
        normalize_credential_definition(&mut definition);
        validate_expected_request(&exchange.open_id.expected_credential_requests, &definition)?;
    }

    if let Some(jwt_did_proof_request) = &step.jwt_did_proof_request {
        let missing = requests.iter().any(|r| r.proof.is_none());
        if missing {
            return Ok(CredentialOutcome::MissingProof(InvalidOrMissingProof {
                error: "invalid_or_missing_proof",
                c_nonce: exchange.id.clone(),
                c_nonce_expires_in: config.access_token_ttl_max.as_secs().try_into().unwrap_or(i64::MAX),
            }));
        }

        let max_clock_skew = exchange
            .open_id
            .oauth2
            .as_ref()
            .and_then(|o| o.max_clock_skew)
            .map_or(TimeDelta::zero(), TimeDelta::seconds);

        let mut dids = Vec::with_capacity(requests.len());
        for request in requests {
            let jwt = request.proof.as_ref().expect("checked above").jwt.as_str();
            check_proof_algorithm(jwt_did_proof_request, jwt)?;
            let verified =
                verify::verify_did_proof_jwt(workflow_id, exchange, jwt, max_clock_skew, resolver).await?;
            check_did_method(jwt_did_proof_request, &verified.did)?;
            dids.push(verified.did);
        }
        if dids.windows(2).any(|w| w[0] != w[1]) {
            return Err(Error::NotAllowed("proof JWTs authenticate different DIDs".to_string()));
        }
        crate::template::set_variable(
            &mut exchange.variables,
            &format!("results.{step_name}.did"),
            Value::String(dids[0].clone()),
        )?;
    } else if step.open_id.is_some() {
        let recorded = exchange
            .variables
            .pointer(&format!("/results/{step_name}/openId/presentationSubmission"));
        if recorded.is_none() {
            let authorization_request = exchange
                .variables
                .pointer(&format!("/results/{step_name}/openId/authorizationRequest"))
                .cloned()
                .unwrap_or(Value::Null);
            return Ok(CredentialOutcome::PresentationRequired(PresentationRequired {
                error: "presentation_required",
                authorization_request,
            }));
        }
    }

    let params: Vec<IssueRequestParams> = issuance::get_issue_request_params(workflow, exchange, step)?;
    let outcome =
        issuance::issue(workflow, exchange, evaluator, capability_client, format, &params, None).await?;

    let mut issued = Vec::new();
    if let Some(vp) = outcome.verifiable_presentation {
        for credential in vp.verifiable_credential.into_iter().flatten() {
            issued.push(to_wire_credential(&credential));
        }
    }
    Ok(CredentialOutcome::Issued(issued))
}

/// Renders an issued credential the way the endpoint returns it: the raw
/// JWT/SD-JWT when enveloped, or the linked-data object otherwise (§4.8
/// final paragraph).
fn to_wire_credential(credential: &crate::w3c_vc::VerifiableCredential) -> Value {
    let value = match credential {
        crate::core::Kind::Object(v) => v.clone(),
        crate::core::Kind::String(s) => return Value::String(s.clone()),
    };
    if let Ok(enveloped) = serde_json::from_value::<Enveloped>(value.clone())
        && enveloped.type_ == "EnvelopedVerifiableCredential"
        && let Some(token) = enveloped.token()
    {
        return Value::String(token.to_string());
    }
    value
}

fn check_proof_algorithm(request: &JwtDidProofRequest, jwt: &str) -> Result<()> {
    if request.allowed_algorithms.is_empty() {
        return Ok(());
    }
    let header_b64 = jwt.split('.').next().ok_or_else(|| invalid!("malformed proof JWT"))?;
    let bytes = base64ct::Base64UrlUnpadded::decode_vec(header_b64)
        .map_err(|e| invalid!("malformed proof JWT header: {e}"))?;
    let header: Value =
        serde_json::from_slice(&bytes).map_err(|e| invalid!("malformed proof JWT header JSON: {e}"))?;
    let alg = header.get("alg").and_then(Value::as_str).unwrap_or_default();
    if !request.allowed_algorithms.iter().any(|a| a == alg) {
        return Err(Error::NotAllowed(format!("proof JWT algorithm '{alg}' not allowed")));
    }
    Ok(())
}

fn check_did_method(request: &JwtDidProofRequest, did: &str) -> Result<()> {
    if request.accepted_methods.is_empty() {
        return Ok(());
    }
    let method = did.strip_prefix("did:").and_then(|rest| rest.split(':').next()).unwrap_or_default();
    if !request.accepted_methods.iter().any(|m| m == method) {
        return Err(Error::NotAllowed(format!("DID method '{method}' not accepted")));
    }
    Ok(())
}

fn validate_expected_request(expected: &[ExpectedCredentialRequest], definition: &Value) -> Result<()> {
    if expected.is_empty() {
        return Ok(());
    }
    let context: Vec<String> = definition
        .get("@context")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let type_: std::collections::BTreeSet<String> = definition
        .get("type")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let matched = expected.iter().any(|entry| {
        entry.context == context
            && entry.type_.iter().cloned().collect::<std::collections::BTreeSet<_>>() == type_
    });
    if !matched {
        return Err(invalid!("credential_definition does not match any expectedCredentialRequests entry"));
    }
    Ok(())
}

/// Generates a fresh pre-authorized code, grounded in the same opaque
/// random-token generation used for `exchange_id` (§4.8, §6).
#[must_use]
pub fn generate_pre_authorized_code() -> String {
    auth_code()
}
