//! # Authorization Response Handling (§4.9 `processAuthorizationResponse`)

use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::capability::CapabilityClient;
use crate::config::EngineConfig;
use crate::exchange::store::Store;
use crate::exchange::State;
use crate::invalid;
use crate::oid4vp::request::get_authorization_request;
use crate::processor::get_step;
use crate::template::TemplateEvaluator;
use crate::vcapi::unenvelope;
use crate::w3c_vc::{Enveloped, VerifiablePresentation};
use crate::workflow::Workflow;
use crate::{issuance, verify, Error, Result};

/// The raw `POST <responseUri>` body (§4.9 step 1).
///
/// Exactly one of `response` (an encrypted JWE, cross-device/JARM style)
/// or `vp_token`+`presentation_submission` (direct form fields) is
/// expected to be present.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AuthorizationResponseBody {
    /// An encrypted JWE carrying `{vp_token, presentation_submission}`.
    #[serde(default)]
    pub response: Option<String>,
    /// The VP token, when sent as a direct form field.
    #[serde(default)]
    pub vp_token: Option<Value>,
    /// The presentation submission, either a JSON object or a JSON-encoded
    /// string (the usual form-post encoding), when sent as a direct field.
    #[serde(default)]
    pub presentation_submission: Option<Value>,
}

/// Decrypts an OID4VP authorization response JWE (§4.9 step 1).
///
/// JWE decryption (ECDH-ES / A256GCM, keyed by the recipient's `kid`) is
/// treated as an external collaborator the same way `TemplateEvaluator`
/// and `CapabilityClient` are: it needs the exchange's key-agreement
/// private key material, which is a distinct concern from the signing
/// keys [`crate::core::keypair::ExchangeSigner`] holds.
pub trait ResponseDecryptor: Send + Sync {
    /// Decrypts `jwe`, returning its JSON payload (`{vp_token,
    /// presentation_submission}`).
    ///
    /// # Errors
    /// Returns [`crate::Error::NotAllowed`] if decryption fails.
    fn decrypt(&self, jwe: &str) -> impl Future<Output = Result<Value>> + Send;
}

/// Outcome of [`process_authorization_response`] (§4.9 step 7).
#[derive(Clone, Debug, Default, Serialize)]
pub struct AuthorizationResponseOutcome {
    /// Present when the step names a `redirectUrl` and nothing remains to
    /// issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

/// Handles one OID4VP authorization response (§4.9
/// `processAuthorizationResponse`).
///
/// # Errors
/// Returns [`crate::Error::DataError`] if the body or presentation
/// submission is malformed, or presentation content fails schema
/// validation; [`crate::Error::InvalidState`] if a prior response already
/// recorded a different `client_profile_id`; [`crate::Error::Operation`]
/// if the verifier capability rejects the presentation.
#[allow(clippy::too_many_arguments)]
pub async fn process_authorization_response(
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
    let (vp_token, presentation_submission) = if let Some(response) = &body.response {
        let decryptor =
            decryptor.ok_or_else(|| invalid!("encrypted authorization response but no decryptor configured"))?;
        let payload = decryptor.decrypt(response).await?;
        let vp_token =
            payload.get("vp_token").cloned().ok_or_else(|| invalid!("decrypted response missing vp_token"))?;
        let submission = payload
            .get("presentation_submission")
            .cloned()
            .ok_or_else(|| invalid!("decrypted response missing presentation_submission"))?;
        (vp_token, submission)
    } else {
        let vp_token = body.vp_token.clone().ok_or_else(|| invalid!("authorization response missing vp_token"))?;
        let submission = match &body.presentation_submission {
            Some(Value::String(encoded)) => serde_json::from_str(encoded)
                .map_err(|e| invalid!("invalid presentation_submission JSON: {e}"))?,
            Some(other) => other.clone(),
            None => return Err(invalid!("authorization response missing presentation_submission")),
        };
        (vp_token, submission)
    };

    validate_presentation_submission(&presentation_submission)?;

    let format = presentation_submission.pointer("/descriptor_map/0/format").and_then(Value::as_str);
    let (presentation_value, enveloped) = interpret_vp_token(&vp_token, format)?;

    let authorization_request = get_authorization_request(
        workflow,
        config,
        workflow_id,
        store,
        evaluator,
        exchange_id,
        exchange_path,
        client_profile_id,
    )
    .await?;

    let mut record = store.get(workflow_id, exchange_id, false).await?;
    let step_name = record
        .exchange
        .step
        .clone()
        .or_else(|| workflow.initial_step.clone())
        .ok_or_else(|| invalid!("workflow has no initialStep and exchange has no current step"))?;

    if let Some(recorded) =
        record.exchange.variables.pointer(&format!("/results/{step_name}/openId/clientProfileId"))
        && recorded.as_str() != client_profile_id
    {
        return Err(Error::InvalidState(
            "authorization response clientProfileId does not match a prior submission".to_string(),
        ));
    }

    let globals = record.exchange.globals(workflow_id);
    let mut scope = record.exchange.variables.clone();
    if let Some(map) = scope.as_object_mut() {
        map.insert("globals".to_string(), globals);
    }
    let step = get_step(workflow, &step_name, &scope, evaluator).await?;

    if let Some(schema) = &step.presentation_schema {
        let contents = unenvelope(&presentation_value);
        let validator =
            validator_for(&schema.json_schema).map_err(|e| invalid!("invalid presentationSchema: {e}"))?;
        if let Err(e) = validator.validate(&contents) {
            return Err(invalid!("received presentation failed schema validation: {e}"));
        }
    }

    let expected_challenge =
        authorization_request.get("nonce").and_then(Value::as_str).unwrap_or(&record.exchange.id).to_string();

    let zcap = workflow
        .zcaps
        .get("verifyPresentation")
        .ok_or_else(|| invalid!("workflow has no 'verifyPresentation' zcap"))?;
    let verify_params = verify::VerifyPresentationParams {
        workflow_id,
        vpr: Some(&authorization_request),
        allow_unprotected_presentation: step.allow_unprotected_presentation,
        verify_presentation_options: step.verify_presentation_options.as_ref(),
        verify_presentation_result_schema: step.verify_presentation_result_schema.as_ref(),
        expected_challenge: Some(&expected_challenge),
    };
    let verify_result =
        verify::verify_presentation(capability_client, zcap, &presentation_value, &verify_params).await?;

    let verification_method =
        verify_result.pointer("/presentationResult/results/0/verificationMethod").cloned();
    let did = match verification_method.as_ref().and_then(Value::as_str) {
        Some(vm_id) => crate::vcapi::resolve_controller(resolver, vm_id).await,
        None => None,
    };

    let mut result_entry = json!({
        "did": did,
        "verificationMethod": verification_method,
        "verifiablePresentation": presentation_value,
        "openId": {
            "clientProfileId": client_profile_id,
            "authorizationRequest": authorization_request,
            "presentationSubmission": presentation_submission,
        },
    });
    if let (Some(envelope), Some(map)) = (&enveloped, result_entry.as_object_mut()) {
        map.insert("envelopedPresentation".to_string(), envelope.clone());
    }
    crate::template::set_variable(&mut record.exchange.variables, &format!("results.{step_name}"), result_entry)?;

    let params = issuance::get_issue_request_params(workflow, &record.exchange, &step)?;
    record.exchange.sequence += 1;
    let redirect_uri = if params.is_empty() {
        record.exchange.state = State::Complete;
        store.complete(workflow_id, record.exchange.clone()).await?;
        step.redirect_url.clone()
    } else {
        record.exchange.state = State::Active;
        store.update(workflow_id, record.exchange.clone()).await?;
        None
    };

    Ok(AuthorizationResponseOutcome { redirect_uri })
}

/// Minimal structural validation of a DIF presentation submission (§4.9
/// step 2); the engine doesn't embed the full DIF Presentation Exchange
/// JSON Schema, just the shape it relies on.
fn validate_presentation_submission(submission: &Value) -> Result<()> {
    let Some(map) = submission.as_object() else {
        return Err(invalid!("presentation_submission must be an object"));
    };
    for key in ["id", "definition_id", "descriptor_map"] {
        if !map.contains_key(key) {
            return Err(invalid!("presentation_submission missing '{key}'"));
        }
    }
    if !map["descriptor_map"].is_array() {
        return Err(invalid!("presentation_submission.descriptor_map must be an array"));
    }
    Ok(())
}

/// Interprets a `vp_token` by format (§4.9 step 3), returning the value to
/// verify and, when the token was enveloped, the envelope recorded
/// alongside the result.
fn interpret_vp_token(vp_token: &Value, format: Option<&str>) -> Result<(Value, Option<Value>)> {
    if format == Some("mso_mdoc") {
        let token = vp_token.as_str().ok_or_else(|| invalid!("mso_mdoc vp_token must be a string"))?;
        let envelope = Enveloped::presentation("application/mdl-vp-token", token);
        let value = serde_json::to_value(&envelope).map_err(|e| invalid!("failed to encode envelope: {e}"))?;
        return Ok((value.clone(), Some(value)));
    }
    match vp_token {
        Value::Object(_) => {
            serde_json::from_value::<VerifiablePresentation>(vp_token.clone())
                .map_err(|e| invalid!("vp_token does not validate as a Verifiable Presentation: {e}"))?;
            Ok((vp_token.clone(), None))
        }
        Value::String(raw) => {
            let media_type = format.unwrap_or("jwt_vp");
            let envelope = Enveloped::presentation(media_type, raw);
            let value = serde_json::to_value(&envelope).map_err(|e| invalid!("failed to encode envelope: {e}"))?;
            Ok((value.clone(), Some(value)))
        }
        _ => Err(invalid!("vp_token must be a JSON object or string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_submission_missing_descriptor_map() {
        let err = validate_presentation_submission(&json!({"id": "1", "definition_id": "pd1"})).unwrap_err();
        assert!(matches!(err, Error::DataError(_)));
    }

    #[test]
    fn accepts_well_formed_submission() {
        let submission = json!({
            "id": "1",
            "definition_id": "pd1",
            "descriptor_map": [{"id": "d1", "format": "jwt_vp_json", "path": "$"}],
        });
        assert!(validate_presentation_submission(&submission).is_ok());
    }

    #[test]
    fn mso_mdoc_token_is_enveloped() {
        let (value, envelope) = interpret_vp_token(&json!("base64token"), Some("mso_mdoc")).unwrap();
        assert_eq!(value["id"], "data:application/mdl-vp-token,base64token");
        assert!(envelope.is_some());
    }

    #[test]
    fn raw_jwt_string_is_enveloped_by_format() {
        let (value, envelope) = interpret_vp_token(&json!("header.payload.sig"), Some("jwt_vp_json")).unwrap();
        assert_eq!(value["id"], "data:jwt_vp_json,header.payload.sig");
        assert!(envelope.is_some());
    }

    #[test]
    fn object_vp_token_passes_through_unenveloped() {
        let vp = json!({
            "@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": "VerifiablePresentation",
        });
        let (value, envelope) = interpret_vp_token(&vp, Some("ldp_vp")).unwrap();
        assert_eq!(value, vp);
        assert!(envelope.is_none());
    }
}
