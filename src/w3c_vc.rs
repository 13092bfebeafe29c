//! # W3C Verifiable Credentials/Presentations (§4.4, §4.5, §4.6)
//!
//! The engine never inspects the semantic content of a credential or
//! presentation — construction (issuance) and cryptographic verification are
//! both delegated to external collaborators (§1). What lives here is just
//! enough of the [VC Data
//! Model](https://www.w3.org/TR/vc-data-model/) to let the processor and
//! issuance engine assemble the envelopes the protocol adapters send over
//! the wire: a presentation wrapping zero or more credentials, and the
//! "enveloped" form used to carry a bare JWT/SD-JWT/mdoc credential inside a
//! linked-data structure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Kind, OneMany};

/// The default `@context` entry for credentials and presentations produced
/// by this crate.
pub const VC_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";

/// A Verifiable Credential, in either linked-data (object) form or
/// enveloped (JWT/SD-JWT/mdoc) form.
///
/// The engine constructs neither directly (§4.5 delegates that to the
/// issuer capability); this type exists so a [`VerifiablePresentation`] can
/// hold a heterogeneous mix of both, mirroring how `issue()` assembles its
/// result (§4.5 step 2 "normalize to `{credential, options?}`").
pub type VerifiableCredential = Kind<Value>;

/// A Verifiable Presentation: the envelope the engine returns to a client
/// and sends to the verifier capability, bundling zero or more credentials
/// (§4.6 step 4d, §4.9 step 5).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VerifiablePresentation {
    /// `@context`, always starting with [`VC_CONTEXT`].
    #[serde(rename = "@context")]
    pub context: Vec<Kind<Value>>,

    /// Presentation id, when the workflow or a step needs to reference it
    /// (e.g. as the OID4VP `nonce`, §4.9).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Always includes `"VerifiablePresentation"`.
    #[serde(rename = "type")]
    pub type_: OneMany<String>,

    /// The credentials being presented.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifiable_credential: Option<Vec<VerifiableCredential>>,

    /// The presenter, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

impl VerifiablePresentation {
    /// An empty presentation with the default context and type, ready to
    /// have issued credentials appended (§4.6 step 4d).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            context: vec![Kind::String(VC_CONTEXT.to_string())],
            type_: OneMany::One("VerifiablePresentation".to_string()),
            ..Self::default()
        }
    }

    /// Appends `credential` to `verifiableCredential`, initializing it if
    /// absent.
    pub fn add_credential(&mut self, credential: VerifiableCredential) {
        self.verifiable_credential.get_or_insert_with(Vec::new).push(credential);
    }
}

/// An `EnvelopedVerifiableCredential`/`EnvelopedVerifiablePresentation`: a
/// non-JSON-LD credential format (JWT, SD-JWT, mdoc CBOR) carried as a data
/// URL inside a linked-data-shaped wrapper (§4.6 deferred delivery, §4.9
/// step 6 `mso_mdoc`).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Enveloped {
    /// `@context`, always `["https://www.w3.org/ns/credentials/v2"]`.
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    /// The data URL, e.g. `data:application/jwt,<jwt>` or
    /// `data:application/mdl-vp-token,<token>`.
    pub id: String,
    /// `"EnvelopedVerifiableCredential"` or `"EnvelopedVerifiablePresentation"`.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Enveloped {
    const CONTEXT: &'static str = "https://www.w3.org/ns/credentials/v2";

    /// Wraps `token` as an `EnvelopedVerifiableCredential` with the given
    /// MIME `media_type` (e.g. `"application/jwt"`).
    #[must_use]
    pub fn credential(media_type: &str, token: &str) -> Self {
        Self {
            context: vec![Self::CONTEXT.to_string()],
            id: format!("data:{media_type},{token}"),
            type_: "EnvelopedVerifiableCredential".to_string(),
        }
    }

    /// Wraps `token` as an `EnvelopedVerifiablePresentation`, used for
    /// `mso_mdoc` presentation submissions (§4.9 step 6).
    #[must_use]
    pub fn presentation(media_type: &str, token: &str) -> Self {
        Self {
            context: vec![Self::CONTEXT.to_string()],
            id: format!("data:{media_type},{token}"),
            type_: "EnvelopedVerifiablePresentation".to_string(),
        }
    }

    /// Extracts the raw token from `id`, stripping the `data:<media_type>,`
    /// prefix.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.id.split_once(',').map(|(_, token)| token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enveloped_credential_roundtrip() {
        let env = Enveloped::credential("application/jwt", "abc.def.ghi");
        assert_eq!(env.id, "data:application/jwt,abc.def.ghi");
        assert_eq!(env.token(), Some("abc.def.ghi"));
    }

    #[test]
    fn presentation_collects_mixed_credentials() {
        let mut vp = VerifiablePresentation::empty();
        vp.add_credential(Kind::Object(json!({"id": "urn:1"})));
        vp.add_credential(Kind::String("header.payload.sig".to_string()));
        assert_eq!(vp.verifiable_credential.unwrap().len(), 2);
    }
}
