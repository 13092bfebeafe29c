//! # Capability Invocation (§4.3) and Provider Composition
//!
//! The engine never talks to an issuer, verifier, challenge, or status
//! service directly (§1 Non-goals) — every outbound call is a delegated
//! capability ("zcap") invocation against a URL named in the workflow. This
//! module defines the [`CapabilityClient`] seam the engine invokes through,
//! and the composed [`Provider`] trait every entry point (`vcapi`,
//! `oid4vci`, `oid4vp`, `invite`) is generic over.

use serde_json::Value;

use crate::error::Result;
use crate::exchange::store::Store;
use crate::template::TemplateEvaluator;
use crate::workflow::Zcap;

/// Invokes a delegated capability against its `invocationTarget` (§4.3).
///
/// Implementations own HTTP transport and ZCAP-LD signing; the engine only
/// ever calls [`CapabilityClient::invoke`] with the capability document and
/// a JSON body, and gets back the decoded JSON response.
pub trait CapabilityClient: Send + Sync {
    /// POSTs `body` to `url.unwrap_or(&zcap.invocation_target)`, authorized
    /// by `zcap`, and returns the decoded JSON response (§4.3 `write`).
    ///
    /// # Errors
    /// Returns [`crate::Error::Operation`] if the downstream service
    /// rejects the invocation or the transport fails (§7).
    fn invoke(
        &self,
        zcap: &Zcap,
        url: Option<&str>,
        body: &Value,
    ) -> impl Future<Output = Result<Value>> + Send;
}

/// Resolves the `/credentials/issue` URL for an issuer capability whose
/// `invocationTarget` names only the issuer base or its `/credentials`
/// collection (§4.3 "URL heuristic"): if `invocation_target` ends in
/// `/credentials`, append `/issue`; if it ends in neither `/credentials`
/// nor `/credentials/issue`, append `/credentials/issue`.
#[must_use]
pub fn resolve_capability_url(invocation_target: &str) -> String {
    let trimmed = invocation_target.trim_end_matches('/');
    if trimmed.ends_with("/credentials") {
        format!("{trimmed}/issue")
    } else if trimmed.ends_with("/credentials/issue") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/credentials/issue")
    }
}

/// Everything the engine needs injected to process an exchange: durable
/// storage, DID resolution, signing, template evaluation, and capability
/// invocation (§1 "external collaborators").
///
/// A blanket implementation covers any type implementing all of the
/// supertraits, so callers only need to implement each concern once (see
/// [`crate::test_utils`] for an in-memory composition used by this crate's
/// own tests).
pub trait Provider:
    Store + TemplateEvaluator + CapabilityClient + credibil_did::DidResolver + Clone
{
}

impl<T> Provider for T where
    T: Store + TemplateEvaluator + CapabilityClient + credibil_did::DidResolver + Clone
{
}
