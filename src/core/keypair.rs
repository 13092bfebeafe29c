//! # Virtual Authorization Server Key Material (§4.8, §6 "Exchange creation")
//!
//! The OID4VCI token endpoint is a per-exchange, self-contained
//! authorization server: it mints `at+jwt` access tokens signed with a key
//! pair generated (or imported) when the exchange is created, and verifies
//! them itself — there is no DID or external issuer involved. This module
//! generates that key pair and wraps it as a [`Signer`] for
//! [`credibil_infosec::jose::JwsBuilder`], grounded in the teacher's
//! `IssuerKeystore::try_sign` pattern of decoding a raw Ed25519 secret and
//! signing with `ed25519-dalek`.
//!
//! Local generation only covers `Ed25519`; `ES256`/`ES384` key pairs may
//! still be *imported* (their JWTs are verified generically by
//! [`crate::verify`] regardless of which algorithm signed them), but this
//! engine doesn't mint EC key pairs itself.

use anyhow::anyhow;
use base64ct::{Base64UrlUnpadded, Encoding};
use credibil_did::PublicKeyJwk;
use credibil_infosec::{Algorithm, PublicKey, Receiver, SharedSecret, Signer};
use ed25519_dalek::Signer as _;
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};

use crate::exchange::KeyPair;

/// Generates a fresh Ed25519 key pair, JWK-encoded (`OKP`/`Ed25519`),
/// for `openId.oauth2.generateKeyPair.algorithm == "Ed25519"`.
#[must_use]
pub fn generate_ed25519() -> KeyPair {
    let mut seed = [0u8; 32];
    rand::fill(&mut seed);
    let signing_key = SigningKey::from_bytes(&seed);
    let x = Base64UrlUnpadded::encode_string(signing_key.verifying_key().as_bytes());
    let d = Base64UrlUnpadded::encode_string(&seed);

    KeyPair {
        public_key_jwk: json!({"kty": "OKP", "crv": "Ed25519", "x": x}),
        private_key_jwk: json!({"kty": "OKP", "crv": "Ed25519", "x": x, "d": d}),
    }
}

/// Signs `at+jwt` access tokens on behalf of one exchange's virtual
/// authorization server (§4.8 "Token endpoint").
///
/// `kid` is reported as [`Signer::verification_method`] and should be the
/// exchange id: tokens are self-issued, so there's no DID to dereference —
/// the verifying side already holds `public_key_jwk` directly.
#[derive(Clone, Debug)]
pub struct ExchangeSigner {
    secret: [u8; 32],
    kid: String,
}

impl ExchangeSigner {
    /// Builds a signer from an exchange's `openId.oauth2.keyPair.privateKeyJwk`.
    ///
    /// # Errors
    /// Returns an error if `private_key_jwk` has no `d` member or it isn't a
    /// 32-byte base64url-encoded Ed25519 secret.
    pub fn from_jwk(private_key_jwk: &Value, kid: impl Into<String>) -> anyhow::Result<Self> {
        let d = private_key_jwk
            .get("d")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("private key JWK missing 'd'"))?;
        let decoded = Base64UrlUnpadded::decode_vec(d)?;
        let secret: [u8; 32] =
            decoded.try_into().map_err(|_| anyhow!("private key JWK 'd' is not 32 bytes"))?;
        Ok(Self { secret, kid: kid.into() })
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret)
    }
}

impl Signer for ExchangeSigner {
    async fn try_sign(&self, msg: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.signing_key().sign(msg).to_bytes().to_vec())
    }

    async fn verifying_key(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.signing_key().verifying_key().as_bytes().to_vec())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::EdDSA
    }

    async fn verification_method(&self) -> anyhow::Result<String> {
        Ok(self.kid.clone())
    }
}

/// An [`ExchangeSigner`] carries no shared-secret agreement key; OID4VP
/// response decryption uses a separate, request-scoped ECDH key (§4.9 step
/// 1), not the virtual authorization server's signing key.
impl Receiver for ExchangeSigner {
    fn key_id(&self) -> String {
        self.kid.clone()
    }

    async fn shared_secret(&self, _sender_public: PublicKey) -> anyhow::Result<SharedSecret> {
        Err(anyhow!("exchange signing key is not an agreement key"))
    }
}

/// Parses `public_key_jwk` (as stored on `exchange.openId.oauth2.keyPair`)
/// into the typed JWK [`credibil_infosec::jose::jws::decode`] expects for
/// signature verification.
///
/// # Errors
/// Returns an error if `public_key_jwk` isn't a well-formed JWK.
pub fn parse_public_jwk(public_key_jwk: &Value) -> anyhow::Result<PublicKeyJwk> {
    serde_json::from_value(public_key_jwk.clone())
        .map_err(|e| anyhow!("malformed public key JWK: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypair_roundtrips_through_signer() {
        let pair = generate_ed25519();
        let signer = ExchangeSigner::from_jwk(&pair.private_key_jwk, "exchange-1").unwrap();
        assert_eq!(signer.algorithm(), Algorithm::EdDSA);

        let x = pair.public_key_jwk.get("x").and_then(Value::as_str).unwrap();
        let expected_public = Base64UrlUnpadded::decode_vec(x).unwrap();
        let actual_public =
            futures::executor::block_on(Signer::verifying_key(&signer)).unwrap();
        assert_eq!(actual_public, expected_public);
    }

    #[test]
    fn parses_public_jwk_for_verification() {
        let pair = generate_ed25519();
        assert!(parse_public_jwk(&pair.public_key_jwk).is_ok());
    }

    #[test]
    fn rejects_keypair_without_private_d() {
        let err = ExchangeSigner::from_jwk(&json!({"kty": "OKP", "crv": "Ed25519"}), "x").unwrap_err();
        assert!(err.to_string().contains('d'));
    }
}
