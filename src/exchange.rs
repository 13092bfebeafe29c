//! # Exchange (§3, §4.1)
//!
//! An [`Exchange`] is a persistent, single-use session driving one holder
//! through one [`crate::workflow::Workflow`]. It is the unit of state the
//! [`crate::processor::Processor`] advances one step at a time, and the
//! unit the [`store`] module persists under compare-and-swap.

pub mod store;

use chrono::{DateTime, TimeDelta, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::core::generate::exchange_id;
use crate::core::keypair;
use crate::invalid;
use crate::workflow::Workflow;
use crate::Result;

/// Lifecycle state of an exchange (§3 "State machine").
///
/// `pending → active → complete`; any of the three may be forced to
/// [`State::Invalid`] on replay (§4.1 step 1, `complete`'s duplicate path).
/// There is no transition out of `Invalid` or back from `Complete`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Created, no client interaction has occurred yet.
    #[default]
    Pending,
    /// At least one client round-trip has happened; not yet terminal.
    Active,
    /// Terminal success.
    Complete,
    /// Terminal failure: a replay of a completed/invalid exchange, or a
    /// lost race on `complete` (§4.1, §8 S6).
    Invalid,
}

impl State {
    /// Whether this state blocks any further processing (§4.6 step 1
    /// "Guard").
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Invalid)
    }
}

/// The asymmetric key pair backing the virtual OID4VCI authorization server
/// for one exchange (§4.8 token endpoint).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// The public key, shared with clients that need to verify tokens this
    /// exchange mints.
    pub public_key_jwk: Value,
    /// The private key used to sign `at+jwt` access tokens (§4.8).
    pub private_key_jwk: Value,
}

/// `exchange.openId`: OID4VCI pre-authorized-code state and the virtual
/// authorization server's key material (§3, §4.8).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenIdState {
    /// The pre-authorized code a wallet exchanges for an access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_authorized_code: Option<String>,

    /// The virtual authorization server's signing key pair, generated at
    /// creation time or imported (§6 "Exchange creation").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<Oauth2State>,

    /// The shapes of `credential_definition` the credential endpoint will
    /// accept, declared at exchange-creation time (§4.8 "Credential
    /// endpoint" rule iii, credential-issuer metadata's
    /// `credential_configurations_supported`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_credential_requests: Vec<ExpectedCredentialRequest>,
}

/// One entry of `exchange.openId.expectedCredentialRequests` (§4.8).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedCredentialRequest {
    /// The credential's `@context` array, matched in order.
    #[serde(rename = "@context", default)]
    pub context: Vec<String>,
    /// The credential's `type` array, matched as a set.
    #[serde(rename = "type")]
    pub type_: Vec<String>,
}

/// Key material for the exchange's virtual OID4VCI authorization server.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Oauth2State {
    /// The generated or imported key pair.
    pub key_pair: KeyPair,
    /// Maximum clock skew tolerance applied to DID-proof JWT verification
    /// (§4.4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_clock_skew: Option<i64>,
}

/// A persistent, single-use session of a workflow (§3 "Exchange").
#[derive(Builder, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into), build_fn(error = "crate::Error"))]
pub struct Exchange {
    /// 128-bit base58/multibase/multihash identifier (§6 "Exchange
    /// creation"; see [`crate::core::generate::exchange_id`]).
    pub id: String,

    /// Monotonically increasing write counter; the store's CAS key (§4.1).
    #[builder(default)]
    pub sequence: u64,

    /// Current lifecycle state.
    #[builder(default)]
    pub state: State,

    /// The name of the step awaiting completion, or `None` before the
    /// first step has been chosen.
    #[builder(default)]
    pub step: Option<String>,

    /// Absolute expiry, RFC-3339 with a `Z` suffix, millisecond-truncated
    /// (§6).
    pub expires: DateTime<Utc>,

    /// Arbitrary JSON scope captured and evolved across steps (§4.2
    /// "Variables scope").
    #[builder(default)]
    pub variables: Value,

    /// Per-protocol working state, keyed by protocol name (`"oid4vp"`,
    /// `"vcapi"`, ...). Opaque to the store; meaningful only to the
    /// adapter that wrote it.
    #[builder(default)]
    pub protocols: Value,

    /// OID4VCI pre-authorized-code and authorization-server state.
    #[builder(default)]
    pub open_id: OpenIdState,

    /// Per-profile key-agreement private keys used to decrypt encrypted
    /// OID4VP responses (§4.9).
    #[builder(default)]
    pub secrets: Value,

    /// The last error recorded against this exchange, rate-limited and
    /// best-effort (§4.1 `setLastError`).
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub last_error: Option<Value>,
}

impl Exchange {
    /// Returns a new [`ExchangeBuilder`].
    #[must_use]
    pub fn builder() -> ExchangeBuilder {
        ExchangeBuilder::default()
    }

    /// The globally-visible, read-only template variables decorating
    /// `variables` during evaluation (§4.2 "Variables scope").
    #[must_use]
    pub fn globals(&self, workflow_id: &str) -> Value {
        serde_json::json!({
            "workflow": { "id": workflow_id },
            "exchange": { "id": self.id },
            // preserved for workflows still referencing the legacy
            // `exchanger`-scoped alias (§9).
            "exchanger": { "id": workflow_id },
        })
    }

    /// `true` once this exchange cannot accept any further writes (§4.6
    /// step 1).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// `POST <workflowBase>/exchanges` request body (§6 "Exchange creation").
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateExchangeRequest {
    /// Relative lifetime in seconds; mutually exclusive with `expires`.
    pub ttl: Option<u64>,
    /// Absolute expiry; mutually exclusive with `ttl`.
    pub expires: Option<DateTime<Utc>>,
    /// Initial `exchange.variables`.
    pub variables: Option<Value>,
    /// Initial current step; must be a key of `workflow.steps` when given.
    pub step: Option<String>,
    /// OID4VCI state to seed the exchange with.
    pub open_id: Option<CreateOpenIdRequest>,
}

/// `openId` member of [`CreateExchangeRequest`] (§6, §4.8).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOpenIdRequest {
    /// The pre-authorized code wallets will exchange for an access token.
    pub pre_authorized_code: Option<String>,
    /// The virtual authorization server's key material.
    pub oauth2: Option<CreateOauth2Request>,
    /// Accepted `credential_definition` shapes for the credential endpoint.
    pub expected_credential_requests: Vec<ExpectedCredentialRequest>,
}

/// `openId.oauth2` member of [`CreateExchangeRequest`] (§6).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOauth2Request {
    /// Requests a freshly generated key pair for the named algorithm
    /// (currently only `"Ed25519"` is supported).
    pub generate_key_pair: Option<GenerateKeyPairRequest>,
    /// An imported key pair, used when `generate_key_pair` is absent.
    pub key_pair: Option<KeyPair>,
    /// Clock skew tolerance applied to DID-proof JWT verification (§4.4).
    pub max_clock_skew: Option<i64>,
}

/// `openId.oauth2.generateKeyPair` member of [`CreateExchangeRequest`] (§6).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeyPairRequest {
    /// The key algorithm to generate.
    pub algorithm: String,
}

/// Builds a new [`Exchange`] from a creation request, applying the defaults
/// and limits in §6 (`ttl`/`expires` mutual exclusion, `ttl` default,
/// `expires` ceiling, `step` membership, key pair generation/import).
///
/// # Errors
/// Returns [`crate::Error::DataError`] if the request violates any of those
/// rules.
pub fn create(workflow: &Workflow, config: &EngineConfig, request: CreateExchangeRequest) -> Result<Exchange> {
    if request.ttl.is_some() && request.expires.is_some() {
        return Err(invalid!("ttl and expires are mutually exclusive"));
    }

    let now = Utc::now();
    let expires = match (request.expires, request.ttl) {
        (Some(expires), None) => expires,
        (None, Some(ttl)) => now + TimeDelta::seconds(i64::try_from(ttl).unwrap_or(i64::MAX)),
        _ => now + TimeDelta::from_std(config.exchange_ttl_default).unwrap_or(TimeDelta::zero()),
    };
    let max_expires = now + TimeDelta::from_std(config.exchange_ttl_max).unwrap_or(TimeDelta::zero());
    if expires > max_expires {
        return Err(invalid!("expires must not be more than {:?} from now", config.exchange_ttl_max));
    }

    if let Some(step) = &request.step
        && !workflow.steps.contains_key(step)
    {
        return Err(invalid!("step '{step}' is not a key of workflow.steps"));
    }

    let open_id = match request.open_id {
        Some(req) => OpenIdState {
            pre_authorized_code: req.pre_authorized_code,
            oauth2: req.oauth2.map(build_oauth2).transpose()?,
            expected_credential_requests: req.expected_credential_requests,
        },
        None => OpenIdState::default(),
    };

    Exchange::builder()
        .id(exchange_id())
        .expires(expires)
        .variables(request.variables.unwrap_or_default())
        .step(request.step)
        .open_id(open_id)
        .build()
}

fn build_oauth2(request: CreateOauth2Request) -> Result<Oauth2State> {
    let key_pair = if let Some(generate) = &request.generate_key_pair {
        match generate.algorithm.as_str() {
            "Ed25519" => keypair::generate_ed25519(),
            other => return Err(invalid!("unsupported generateKeyPair.algorithm '{other}'")),
        }
    } else if let Some(key_pair) = request.key_pair {
        key_pair
    } else {
        return Err(invalid!("openId.oauth2 requires either generateKeyPair or keyPair"));
    };
    Ok(Oauth2State { key_pair, max_clock_skew: request.max_clock_skew })
}

/// Bookkeeping kept alongside an [`Exchange`] by the store, not visible to
/// template evaluation (§3 "Exchange record").
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// When the record was first inserted.
    pub created: DateTime<Utc>,
    /// When the record was last written.
    pub updated: DateTime<Utc>,
    /// The authoritative time-based eviction key (§4.1 "Indices").
    pub expires: DateTime<Utc>,
}

/// An exchange together with its store-owned bookkeeping (§3 "Exchange
/// record").
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    /// The exchange itself.
    pub exchange: Exchange,
    /// Store bookkeeping.
    pub meta: Meta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!State::Pending.is_terminal());
        assert!(!State::Active.is_terminal());
        assert!(State::Complete.is_terminal());
        assert!(State::Invalid.is_terminal());
    }

    #[test]
    fn globals_includes_legacy_exchanger_alias() {
        let exchange = Exchange::builder()
            .id("zABC")
            .expires(Utc::now())
            .build()
            .unwrap();
        let globals = exchange.globals("https://issuer.example/workflows/w1");
        assert_eq!(globals["exchange"]["id"], "zABC");
        assert_eq!(
            globals["exchanger"]["id"],
            "https://issuer.example/workflows/w1"
        );
    }
}
