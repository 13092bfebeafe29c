//! # Token Endpoint (§4.8 "Token endpoint")

use chrono::{TimeDelta, Utc};
use credibil_infosec::jose::jwt::Jwt;
use credibil_infosec::jose::JwsBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::core::keypair::{parse_public_jwk, ExchangeSigner};
use crate::core::strings::constant_time_eq;
use crate::exchange::Exchange;
use crate::oauth::{GrantType, TokenResponse};
use crate::{invalid, Error, Result};

/// `POST <exchangePath>/openid/token` request body (§4.8).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct TokenRequest {
    /// Must be [`GrantType::PreAuthorizedCode`]; any other value is rejected.
    pub grant_type: GrantType,
    /// The code handed out on the credential offer, compared in constant
    /// time against `exchange.openId.preAuthorizedCode`.
    #[serde(rename = "pre-authorized_code")]
    pub pre_authorized_code: String,
}

/// Registered claims carried by a minted `at+jwt` access token (§4.8).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccessTokenClaims {
    /// Always the exchange id.
    pub iss: String,
    /// Always the exchange id — tokens are self-issued and self-verified.
    pub aud: String,
    /// `"write:<exchange-id>"`.
    pub scope: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// Mints an `at+jwt` access token for `exchange` after validating the
/// pre-authorized code (§4.8 "Token endpoint").
///
/// # Errors
/// Returns [`crate::Error::NotAllowed`] if `grant_type` isn't the
/// pre-authorized-code grant or the code doesn't match; returns
/// [`crate::Error::DataError`] if the exchange has no virtual authorization
/// server key material.
pub async fn process_token_request(
    config: &EngineConfig,
    exchange: &Exchange,
    meta_expires: chrono::DateTime<Utc>,
    request: &TokenRequest,
) -> Result<TokenResponse> {
    if !matches!(request.grant_type, GrantType::PreAuthorizedCode) {
        return Err(Error::NotAllowed("unsupported grant_type".to_string()));
    }

    let expected = exchange
        .open_id
        .pre_authorized_code
        .as_deref()
        .ok_or_else(|| invalid!("exchange has no pre-authorized code"))?;
    if !constant_time_eq(&request.pre_authorized_code, expected) {
        return Err(Error::NotAllowed("pre-authorized_code does not match".to_string()));
    }

    let oauth2 = exchange
        .open_id
        .oauth2
        .as_ref()
        .ok_or_else(|| invalid!("exchange has no virtual authorization server key pair"))?;

    let signer = ExchangeSigner::from_jwk(&oauth2.key_pair.private_key_jwk, exchange.id.clone())?;

    let max_ttl = TimeDelta::from_std(config.access_token_ttl_max).unwrap_or(TimeDelta::zero());
    let exp = meta_expires.min(Utc::now() + max_ttl);

    let claims = AccessTokenClaims {
        iss: exchange.id.clone(),
        aud: exchange.id.clone(),
        scope: format!("write:{}", exchange.id),
        exp: exp.timestamp(),
    };

    let jws = JwsBuilder::new()
        .jwt_type("at+jwt")
        .payload(claims)
        .add_signer(&signer)
        .build()
        .await
        .map_err(|e| invalid!("failed to build access token: {e}"))?;
    let access_token = jws.encode().map_err(|e| invalid!("failed to encode access token: {e}"))?;

    Ok(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: (exp - Utc::now()).num_seconds().max(0),
    })
}

/// Verifies a bearer access token minted by [`process_token_request`]
/// against `exchange`'s own public key (§4.8 "Credential endpoint": "Verify
/// access token").
///
/// Tokens are self-signed: the verifying side ignores the JWT header's
/// `kid` and uses `exchange.openId.oauth2.keyPair.publicKeyJwk` directly.
///
/// # Errors
/// Returns [`crate::Error::NotAllowed`] if the token's signature, audience,
/// or expiry don't check out.
pub async fn verify_access_token(exchange: &Exchange, access_token: &str) -> Result<AccessTokenClaims> {
    let oauth2 = exchange
        .open_id
        .oauth2
        .as_ref()
        .ok_or_else(|| invalid!("exchange has no virtual authorization server key pair"))?;
    let public_jwk = parse_public_jwk(&oauth2.key_pair.public_key_jwk)?;

    let decoded: Jwt<AccessTokenClaims> =
        credibil_infosec::jose::jws::decode(access_token, move |_kid: String| {
            let jwk = public_jwk.clone();
            async move { Ok(jwk) }
        })
        .await
        .map_err(|e| Error::NotAllowed(format!("invalid access token signature: {e}")))?;
    let claims = decoded.claims;

    if claims.aud != exchange.id {
        return Err(Error::NotAllowed("access token audience mismatch".to_string()));
    }
    if claims.exp < Utc::now().timestamp() {
        return Err(Error::NotAllowed("access token has expired".to_string()));
    }
    Ok(claims)
}

/// Normalizes `credential_definition.types` (the OID4VCI draft's plural
/// spelling) to the current `type` member, in place (§4.8 "Credential
/// endpoint" rule i).
pub fn normalize_credential_definition(definition: &mut Value) {
    let Some(map) = definition.as_object_mut() else { return };
    if !map.contains_key("type")
        && let Some(types) = map.remove("types")
    {
        map.insert("type".to_string(), types);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exchange_with_code(code: &str) -> Exchange {
        let pair = crate::core::keypair::generate_ed25519();
        Exchange::builder()
            .id("zTokenTest")
            .expires(Utc::now() + TimeDelta::minutes(15))
            .open_id(crate::exchange::OpenIdState {
                pre_authorized_code: Some(code.to_string()),
                oauth2: Some(crate::exchange::Oauth2State { key_pair: pair, max_clock_skew: None }),
                expected_credential_requests: Vec::new(),
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn mints_and_verifies_roundtrip() {
        let exchange = exchange_with_code("abc123");
        let config = EngineConfig::default();
        let request = TokenRequest {
            grant_type: GrantType::PreAuthorizedCode,
            pre_authorized_code: "abc123".to_string(),
        };
        let response = process_token_request(&config, &exchange, exchange.expires, &request).await.unwrap();
        assert_eq!(response.token_type, "bearer");

        let claims = verify_access_token(&exchange, &response.access_token).await.unwrap();
        assert_eq!(claims.aud, "zTokenTest");
    }

    #[tokio::test]
    async fn rejects_mismatched_code() {
        let exchange = exchange_with_code("abc123");
        let config = EngineConfig::default();
        let request = TokenRequest {
            grant_type: GrantType::PreAuthorizedCode,
            pre_authorized_code: "wrong".to_string(),
        };
        let err = process_token_request(&config, &exchange, exchange.expires, &request).await.unwrap_err();
        assert!(matches!(err, Error::NotAllowed(_)));
    }

    #[test]
    fn normalizes_types_alias() {
        let mut def = json!({"types": ["VerifiableCredential", "Foo"]});
        normalize_credential_definition(&mut def);
        assert_eq!(def["type"], json!(["VerifiableCredential", "Foo"]));
        assert!(def.get("types").is_none());
    }
}
