//! # Verification Gateway (§4.4)
//!
//! Two distinct kinds of verification happen at the boundary of an
//! exchange: verifying a DID-proof JWT presented by a holder (done locally,
//! since it only needs DID resolution and JOSE primitives already in this
//! crate's dependency stack), and verifying a full Verifiable Presentation
//! (delegated to a remote verifier capability, since presentation
//! cryptography and exchange-format negotiation are out of scope, §1).

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{TimeDelta, Utc};
use credibil_did::{DidResolver, Resource};
use credibil_infosec::jose::jwt::Jwt;
use credibil_infosec::jose::jws;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityClient;
use crate::error::Result;
use crate::exchange::Exchange;
use crate::workflow::Zcap;
use crate::{invalid, operation, verify_key};

/// Algorithms accepted on a DID-proof JWT (§4.4).
const ALLOWED_ALGORITHMS: &[&str] = &["ES256", "ES384", "Ed25519", "EdDSA"];

/// Registered claims carried by a proof-of-possession JWT (§4.4, §4.8).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DidProofClaims {
    /// The authenticating DID.
    pub iss: String,
    /// `<workflow.id>/exchanges/<exchange.id>`.
    pub aud: String,
    /// Must equal `exchange.id`.
    pub nonce: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    /// Not-before, seconds since epoch.
    pub nbf: i64,
}

/// Outcome of a successful DID-proof JWT verification (§4.4).
#[derive(Clone, Debug, Serialize)]
pub struct DidProofVerified {
    /// Always `true`; verification failure is signaled via `Err` instead.
    pub verified: bool,
    /// The authenticated DID.
    pub did: String,
}

/// Verifies a DID-proof JWT presented against `workflow_id`/`exchange`
/// (§4.4 `verifyDidProofJwt`).
///
/// Checks, in order: the header's algorithm is in [`ALLOWED_ALGORITHMS`];
/// the signature, against the key the `kid` resolves to; the resolved
/// verification method's controller authorized that key for
/// `authentication`; `aud` equals `<workflow_id>/exchanges/<exchange.id>`;
/// `exp`/`nbf` within `max_clock_skew` of now; `iss` equals the
/// verification method's controller; `nonce` equals `exchange.id`.
///
/// # Errors
/// Returns [`crate::Error::NotAllowed`] if any check fails.
pub async fn verify_did_proof_jwt(
    workflow_id: &str,
    exchange: &Exchange,
    jwt: &str,
    max_clock_skew: TimeDelta,
    resolver: &(impl DidResolver + Clone),
) -> Result<DidProofVerified> {
    let kid = header_kid(jwt)?;
    let alg = header_alg(jwt)?;
    if !ALLOWED_ALGORITHMS.contains(&alg.as_str()) {
        return Err(crate::Error::NotAllowed(format!("unsupported proof JWT algorithm '{alg}'")));
    }

    let deref = credibil_did::dereference(&kid, None, resolver.clone())
        .await
        .map_err(|e| crate::Error::NotAllowed(format!("issue dereferencing DID URL: {e}")))?;
    let Some(Resource::VerificationMethod(vm)) = deref.content_stream else {
        return Err(crate::Error::NotAllowed("verification method not found".to_string()));
    };
    let controller = vm.controller.clone();

    let document = resolver
        .resolve(&kid)
        .await
        .map_err(|e| crate::Error::NotAllowed(format!("issue resolving DID document: {e}")))?;
    let authorized = document.authentication.iter().flatten().any(|id| id == &kid);
    if !authorized {
        return Err(crate::Error::NotAllowed(
            "verification method is not authorized for authentication".to_string(),
        ));
    }

    let decoded: Jwt<DidProofClaims> = jws::decode(jwt, verify_key!(resolver.clone()))
        .await
        .map_err(|e| crate::Error::NotAllowed(format!("invalid proof JWT signature: {e}")))?;
    let claims = decoded.claims;

    let expected_aud = format!("{workflow_id}/exchanges/{}", exchange.id);
    if claims.aud != expected_aud {
        return Err(crate::Error::NotAllowed("proof JWT audience mismatch".to_string()));
    }

    let now = Utc::now().timestamp();
    let skew = max_clock_skew.num_seconds();
    if claims.exp + skew < now {
        return Err(crate::Error::NotAllowed("proof JWT has expired".to_string()));
    }
    if claims.nbf - skew > now {
        return Err(crate::Error::NotAllowed("proof JWT not yet valid".to_string()));
    }
    if claims.iss != controller {
        return Err(crate::Error::NotAllowed("proof JWT issuer is not the key controller".to_string()));
    }
    if claims.nonce != exchange.id {
        return Err(crate::Error::NotAllowed("proof JWT nonce does not match exchange id".to_string()));
    }

    Ok(DidProofVerified { verified: true, did: claims.iss })
}

/// Parameters to [`verify_presentation`], mirroring C4's own argument list
/// (§4.4 `verify`).
pub struct VerifyPresentationParams<'a> {
    /// The workflow the exchange belongs to, used to derive `domain` when
    /// `vpr` doesn't name one.
    pub workflow_id: &'a str,
    /// The Verifiable Presentation Request this presentation answers, if
    /// any (carries `domain`/`challenge` defaults).
    pub vpr: Option<&'a Value>,
    /// Allows `checks` to drop `"proof"` when the presentation carries none
    /// (§4.4 step 2).
    pub allow_unprotected_presentation: bool,
    /// Forwarded verbatim into the invocation's `options`.
    pub verify_presentation_options: Option<&'a Value>,
    /// JSON Schema the verifier's result must satisfy (§4.4 step 6).
    pub verify_presentation_result_schema: Option<&'a Value>,
    /// The challenge the engine expects, if it minted or otherwise fixed
    /// one ahead of time.
    pub expected_challenge: Option<&'a str>,
}

/// Delegates full presentation verification to the remote verifier
/// capability, computing `checks`/`domain`/`challenge` and validating the
/// result shape the same way for every adapter that calls it (§4.4
/// `verify`).
///
/// # Errors
/// Returns [`crate::Error::Operation`] if the verifier rejects the
/// presentation or the invocation fails, or [`crate::Error::DataError`] if
/// `verifyPresentationResultSchema` is configured and the result fails to
/// validate against it.
pub async fn verify_presentation(
    client: &impl CapabilityClient,
    zcap: &Zcap,
    verifiable_presentation: &Value,
    params: &VerifyPresentationParams<'_>,
) -> Result<Value> {
    let has_proof = verifiable_presentation.get("proof").is_some()
        || verifiable_presentation.get("type").and_then(Value::as_str)
            == Some("EnvelopedVerifiablePresentation");

    let mut checks = vec!["proof".to_string()];
    if !has_proof && params.allow_unprotected_presentation {
        checks.retain(|c| c != "proof");
    }
    if params.expected_challenge.is_none() {
        checks.push("challenge".to_string());
    }

    let domain = params
        .vpr
        .and_then(|vpr| vpr.get("domain"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| origin(params.workflow_id));
    let challenge = params
        .expected_challenge
        .map(str::to_string)
        .or_else(|| params.vpr.and_then(|vpr| vpr.get("challenge")).and_then(Value::as_str).map(str::to_string))
        .or_else(|| {
            verifiable_presentation.pointer("/proof/challenge").and_then(Value::as_str).map(str::to_string)
        });

    let mut options = params.verify_presentation_options.cloned().unwrap_or_else(|| serde_json::json!({}));
    if let Some(map) = options.as_object_mut() {
        map.entry("checks").or_insert_with(|| serde_json::json!(checks));
        map.entry("domain").or_insert_with(|| serde_json::json!(domain));
    }

    let mut body = serde_json::json!({
        "verifiablePresentation": verifiable_presentation,
        "options": options,
    });
    if let (Some(challenge), Some(map)) = (&challenge, body.as_object_mut()) {
        map.insert("challenge".to_string(), serde_json::json!(challenge));
    }

    let result = client
        .invoke(zcap, None, &body)
        .await
        .map_err(|e| operation!("verifier capability rejected presentation: {e}"))?;

    if let Some(schema) = params.verify_presentation_result_schema {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| invalid!("invalid verifyPresentationResultSchema: {e}"))?;
        if let Err(e) = validator.validate(&result) {
            return Err(invalid!("verifier result failed schema validation: {e}"));
        }
    }

    Ok(result)
}

/// The scheme-and-authority prefix of `url` (§4.4 step 3 `origin`).
fn origin(url: &str) -> String {
    let scheme_end = url.find("://").map_or(0, |i| i + 3);
    let authority_end = url[scheme_end..].find('/').map_or(url.len(), |i| scheme_end + i);
    url[..authority_end].to_string()
}

fn header_segment(jwt: &str) -> Result<Value> {
    let header_b64 = jwt.split('.').next().ok_or_else(|| invalid!("malformed JWT"))?;
    let bytes = Base64UrlUnpadded::decode_vec(header_b64).map_err(|e| invalid!("malformed JWT header: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| invalid!("malformed JWT header JSON: {e}"))
}

fn header_kid(jwt: &str) -> Result<String> {
    header_segment(jwt)?
        .get("kid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid!("JWT header missing 'kid'"))
}

fn header_alg(jwt: &str) -> Result<String> {
    header_segment(jwt)?
        .get("alg")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid!("JWT header missing 'alg'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_kid_extracts_from_real_shaped_jwt() {
        let header = Base64UrlUnpadded::encode_string(
            json!({"alg": "EdDSA", "kid": "did:key:z6Mk#z6Mk"}).to_string().as_bytes(),
        );
        let jwt = format!("{header}.payload.sig");
        assert_eq!(header_kid(&jwt).unwrap(), "did:key:z6Mk#z6Mk");
        assert_eq!(header_alg(&jwt).unwrap(), "EdDSA");
    }

    #[test]
    fn rejects_malformed_jwt() {
        assert!(header_kid("not-a-jwt").is_err());
    }

    #[tokio::test]
    async fn accepts_proof_jwt_from_an_authorized_authentication_key() {
        use credibil_infosec::jose::JwsBuilder;

        use crate::exchange::Exchange;
        use crate::test_utils::{TestDidResolver, TestIdentity};

        let holder = TestIdentity::generate();
        let resolver = TestDidResolver::new();
        resolver.register(&holder);

        let exchange = Exchange::builder()
            .id("z1")
            .expires(Utc::now() + TimeDelta::minutes(5))
            .build()
            .unwrap();
        let now = Utc::now().timestamp();
        let claims = DidProofClaims {
            iss: holder.did(),
            aud: format!("https://issuer.example/w1/exchanges/{}", exchange.id),
            nonce: exchange.id.clone(),
            exp: now + 60,
            nbf: now - 60,
        };
        let jws = JwsBuilder::new()
            .jwt_type("openid4vci-proof+jwt")
            .payload(claims)
            .add_signer(&holder)
            .build()
            .await
            .unwrap();
        let jwt = jws.encode().unwrap();

        let verified = verify_did_proof_jwt(
            "https://issuer.example/w1",
            &exchange,
            &jwt,
            TimeDelta::seconds(30),
            &resolver,
        )
        .await
        .unwrap();
        assert_eq!(verified.did, holder.did());
    }
}
