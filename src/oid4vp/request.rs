//! # Authorization Request Construction (§4.9 `getAuthorizationRequest`)

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::exchange::store::Store;
use crate::exchange::{Exchange, State};
use crate::invalid;
use crate::processor::get_step;
use crate::template::TemplateEvaluator;
use crate::workflow::{ClientProfile, Step, Workflow};
use crate::{Error, Result};

/// Bound on the retry-on-conflict loop (§4.9 step 3 is the only caller in
/// the engine allowed to retry a CAS conflict).
const MAX_ATTEMPTS: u32 = 5;

/// Resolves (constructing and caching if necessary) the authorization
/// request for `exchange_id`'s current step, transitioning the exchange
/// `pending → active` along the way (§4.9 `getAuthorizationRequest`).
///
/// Retries on [`crate::Error::InvalidState`] up to [`MAX_ATTEMPTS`] times,
/// re-reading the record each time — the only CAS-conflict retry loop in
/// the engine.
///
/// # Errors
/// Returns [`crate::Error::NotSupported`] if the current step carries no
/// `openId` configuration, or [`crate::Error::DataError`] if
/// `client_profile_id` doesn't resolve to a known profile.
pub async fn get_authorization_request(
    workflow: &Workflow,
    config: &EngineConfig,
    workflow_id: &str,
    store: &impl Store,
    evaluator: &impl TemplateEvaluator,
    exchange_id: &str,
    exchange_path: &str,
    client_profile_id: Option<&str>,
) -> Result<Value> {
    for attempt in 1..=MAX_ATTEMPTS {
        let mut record = store.get(workflow_id, exchange_id, false).await?;
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

        let Some(open_id) = &step.open_id else {
            return Err(Error::NotSupported("step does not support OID4VP".to_string()));
        };
        let profile = open_id
            .profile(client_profile_id)
            .ok_or_else(|| invalid!("unknown OID4VP client profile"))?
            .clone();

        let authorization_request = if let Some(literal) = &profile.authorization_request {
            literal.clone()
        } else {
            let var_name = profile.create_authorization_request.as_deref().ok_or_else(|| {
                invalid!("client profile has neither authorizationRequest nor createAuthorizationRequest")
            })?;
            match fresh_cached_request(&record.exchange.variables, var_name, config.vpr_request_object_ttl) {
                Some(cached) => cached,
                None => {
                    let constructed =
                        construct_authorization_request(&profile, &step, &record.exchange, exchange_path);
                    let entry = json!({"value": constructed, "cachedAt": Utc::now().to_rfc3339()});
                    crate::template::set_variable(&mut record.exchange.variables, var_name, entry)?;
                    constructed
                }
            }
        };

        if record.exchange.state.is_terminal() {
            return Ok(authorization_request);
        }
        if matches!(record.exchange.state, State::Pending) {
            record.exchange.state = State::Active;
        }
        record.exchange.sequence += 1;
        match store.update(workflow_id, record.exchange.clone()).await {
            Ok(_) => return Ok(authorization_request),
            Err(Error::InvalidState(_)) if attempt < MAX_ATTEMPTS => continue,
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop always returns or propagates by the final attempt")
}

/// Returns the cached authorization request at `var_name` if one exists and
/// is younger than `ttl`, discarding a stale or malformed entry so the
/// caller reconstructs it (§4.13 `vprRequestObjectTtl`).
fn fresh_cached_request(variables: &Value, var_name: &str, ttl: std::time::Duration) -> Option<Value> {
    let entry = variables.get(var_name)?;
    let cached_at = entry.get("cachedAt").and_then(Value::as_str)?;
    let cached_at = chrono::DateTime::parse_from_rfc3339(cached_at).ok()?;
    let age = Utc::now().signed_duration_since(cached_at);
    if age < chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX) {
        entry.get("value").cloned()
    } else {
        None
    }
}

/// Builds an authorization request from a step's VPR and client profile
/// defaults (§4.9 step 2).
fn construct_authorization_request(
    profile: &ClientProfile,
    step: &Step,
    exchange: &Exchange,
    exchange_path: &str,
) -> Value {
    let vpr = step.verifiable_presentation_request.clone().unwrap_or(Value::Null);
    let mut request = from_vpr(&vpr);

    let client_id_scheme = profile.client_id_scheme.clone().unwrap_or_else(|| "redirect_uri".to_string());
    let mut response_mode = profile.response_mode.clone().unwrap_or_else(|| "direct_post".to_string());
    if client_id_scheme == "x509_san_dns" && response_mode == "direct_post" {
        response_mode = "direct_post.jwt".to_string();
    }
    let response_uri =
        profile.response_uri.clone().unwrap_or_else(|| format!("{exchange_path}/authorization/response"));
    let client_id = profile.client_id.clone().unwrap_or_else(|| response_uri.clone());
    let nonce = profile.nonce.clone().unwrap_or_else(|| exchange.id.clone());
    let client_metadata = profile.client_metadata.clone().unwrap_or_else(|| default_client_metadata(&client_id_scheme));

    if let Some(map) = request.as_object_mut() {
        map.insert("client_id_scheme".to_string(), json!(client_id_scheme));
        map.insert("response_mode".to_string(), json!(response_mode));
        map.insert("response_uri".to_string(), json!(response_uri));
        map.insert("client_id".to_string(), json!(client_id));
        map.insert("nonce".to_string(), json!(nonce));
        map.insert("client_metadata".to_string(), client_metadata);
    }
    request
}

/// Builds the `response_type=vp_token` base request from a step's VPR
/// (§4.9 step 2 "`oid4vp.fromVpr`"). The VPR is opaque to this engine
/// (§1 Non-goals); whatever query shape it carries — a DIF presentation
/// definition, a DCQL query, or a bespoke `query` array — is copied
/// through verbatim.
fn from_vpr(vpr: &Value) -> Value {
    let mut request = json!({"response_type": "vp_token"});
    if let (Some(map), Some(source)) = (request.as_object_mut(), vpr.as_object()) {
        for key in ["presentation_definition", "dcql_query", "query"] {
            if let Some(value) = source.get(key) {
                map.insert(key.to_string(), value.clone());
            }
        }
    }
    request
}

/// Auto-generated `client_metadata` for a profile that doesn't supply its
/// own (§4.9 step 2).
fn default_client_metadata(client_id_scheme: &str) -> Value {
    let mut metadata = json!({
        "vp_formats": {
            "jwt_vp": {"alg": ["EdDSA", "ES256"]},
            "jwt_vp_json": {"alg": ["EdDSA", "ES256"]},
            "di_vp": {"proof_type": ["DataIntegrityProof", "Ed25519Signature2020"]},
            "ldp_vp": {"proof_type": ["Ed25519Signature2020"]},
            "mso_mdoc": {"alg": ["ES256"]},
        },
    });
    if client_id_scheme == "x509_san_dns"
        && let Some(map) = metadata.as_object_mut()
    {
        map.insert("require_signed_request_object".to_string(), json!(true));
    }
    metadata
}
