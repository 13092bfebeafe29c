//! # Workflow (§3, §4.11)
//!
//! A `Workflow` is the immutable configuration an exchange is created from:
//! its steps, credential templates, issuer instances, delegated
//! authorizations (zcaps), and OID4VP client profiles. Workflows are loaded
//! from JSON by the (out-of-scope) CRUD surface and handed to the engine by
//! reference; this module only defines their shape and structural
//! invariants.

pub mod validate;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::template::TypedTemplate;

/// A declarative template for an exchange.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// The workflow's identifier, a URL under which its exchanges are
    /// created (`<id>/exchanges`).
    pub id: String,

    /// The name of the step an exchange starts on when none is specified at
    /// creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_step: Option<String>,

    /// Named steps, each either static or template-produced.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub steps: HashMap<String, StepOrTemplate>,

    /// Templates used by the issuance engine (§4.5) to build credentials.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_templates: Vec<CredentialTemplate>,

    /// Issuer instances, each declaring the credential formats it supports
    /// and which delegated capability to invoke for `/credentials/issue`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issuer_instances: Vec<IssuerInstance>,

    /// Delegated capabilities (zcaps), keyed by reference id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub zcaps: HashMap<String, Zcap>,

    /// OID4VP client profiles available to steps that don't declare their
    /// own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid4vp_client_profiles: Option<HashMap<String, ClientProfile>>,
}

impl Workflow {
    /// The reference id of the delegated capability used to issue a
    /// credential in the given `format`, if any issuer instance supports it.
    #[must_use]
    pub fn issue_zcap_for_format(&self, format: &str) -> Option<&str> {
        self.issuer_instances
            .iter()
            .find(|i| i.supported_formats.iter().any(|f| f == format))
            .map(|i| i.zcap_reference_ids.issue.as_str())
    }

    /// The union of credential formats supported by all issuer instances.
    #[must_use]
    pub fn supported_formats(&self) -> Vec<&str> {
        self.issuer_instances.iter().flat_map(|i| i.supported_formats.iter().map(String::as_str)).collect()
    }
}

/// A step, either fully specified or produced from a template at evaluation
/// time (§3 "Step").
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StepOrTemplate {
    /// A step whose shape must be resolved by evaluating `step_template`
    /// against the current exchange (§4.2 `evaluateExchangeStep`).
    Template {
        /// The typed template to evaluate.
        step_template: TypedTemplate,
    },
    /// A fully specified, static step.
    Static(Box<Step>),
}

/// A single node of the workflow state machine (§3 "Step").
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Step {
    /// A Verifiable Presentation Request to send the client when input is
    /// required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifiable_presentation_request: Option<Value>,

    /// Whether a fresh challenge should be minted for this step's VPR
    /// (§4.7).
    pub create_challenge: bool,

    /// JSON Schema the contents of a received presentation must satisfy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_schema: Option<PresentationSchema>,

    /// Constraints on a DID-proof JWT accepted at the OID4VCI credential
    /// endpoint (§4.8).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_did_proof_request: Option<JwtDidProofRequest>,

    /// OID4VP configuration for this step: either a single legacy profile
    /// or a map of named client profiles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_id: Option<OpenIdStepConfig>,

    /// Credential issuance requests to run when this step completes (§4.5).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_requests: Option<Vec<IssueRequest>>,

    /// A literal, out-of-band VP to seed the response with before any
    /// issued credentials are appended (§4.6 step 4d).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifiable_presentation: Option<Value>,

    /// A URL the client should be redirected to on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,

    /// The name of the step to transition to next; absent means this step
    /// is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,

    /// Allow verification to proceed without a `proof` when the
    /// presentation's format has no embedded proof (§4.4).
    pub allow_unprotected_presentation: bool,

    /// Extra options forwarded verbatim to the verifier capability (§4.4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_presentation_options: Option<Value>,

    /// JSON Schema the verifier's result must satisfy (§4.4 step 6).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_presentation_result_schema: Option<Value>,

    /// Invite-request configuration (§4.10); presence marks this step as an
    /// invite-request step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_request: Option<Value>,
}

impl Step {
    /// Whether this step supports the VC-API protocol (§4.7): it has
    /// something to ask for, something to hand back, or credentials to
    /// issue.
    #[must_use]
    pub fn supports_vcapi(&self, workflow: &Workflow) -> bool {
        self.verifiable_presentation_request.is_some()
            || self.verifiable_presentation.is_some()
            || !workflow.credential_templates.is_empty()
    }
}

/// JSON Schema applied to a received presentation's contents (§4.7).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationSchema {
    /// Always `"jsonSchema"` in the current schema type enum.
    #[serde(rename = "type")]
    pub type_: String,
    /// The JSON Schema document.
    pub json_schema: Value,
}

/// Constraints on proof-of-possession JWTs accepted at the credential
/// endpoint (§4.8).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtDidProofRequest {
    /// DID methods the holder may authenticate with.
    #[serde(default)]
    pub accepted_methods: Vec<String>,
    /// Signature algorithms accepted on the proof JWT.
    #[serde(default)]
    pub allowed_algorithms: Vec<String>,
}

/// OID4VP configuration for a step: either one legacy profile inline, or a
/// map of named client profiles (§4.9 step 1).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OpenIdStepConfig {
    /// Multiple named client profiles, selectable by id.
    Profiles {
        /// Profiles keyed by client-profile id.
        client_profiles: HashMap<String, ClientProfile>,
    },
    /// A single, legacy (un-named) profile.
    Legacy(Box<ClientProfile>),
}

impl OpenIdStepConfig {
    /// Resolves the client profile for `client_profile_id`, or the sole
    /// legacy profile when none is named (§4.9 step 1).
    #[must_use]
    pub fn profile(&self, client_profile_id: Option<&str>) -> Option<&ClientProfile> {
        match self {
            Self::Profiles { client_profiles } => {
                client_profile_id.and_then(|id| client_profiles.get(id))
            }
            Self::Legacy(profile) => Some(profile),
        }
    }
}

/// A single OID4VP client profile (§4.9).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientProfile {
    /// A literal authorization request to use verbatim, bypassing
    /// construction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_request: Option<Value>,

    /// The name of the exchange variable under which a constructed
    /// authorization request is cached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_authorization_request: Option<String>,

    /// `client_id_scheme`, defaulting to `"redirect_uri"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_scheme: Option<String>,

    /// `response_mode`, defaulting to `"direct_post"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,

    /// `response_uri`, defaulting to `<clientBase>/authorization/response`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_uri: Option<String>,

    /// `client_id`, defaulting to `response_uri`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// `nonce`, defaulting to the exchange id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// `client_metadata`, auto-generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_metadata: Option<Value>,

    /// Whether this step supports the invite-request protocol (§4.10).
    pub supports_invite_request: bool,

    /// Whether this step supports the OID4VCI bridge (§4.8).
    pub supports_oid4vci: bool,

    /// Whether this step supports OID4VP (always true for a resolved
    /// profile, kept explicit for capability-set polymorphism per §9).
    pub supports_oid4vp: bool,
}

/// A single credential-issuance template (§3 "Workflow").
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialTemplate {
    /// Optional stable identifier, addressable from `IssueRequest::credential_template_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The template, currently always `type: "jsonata"`.
    #[serde(flatten)]
    pub template: TypedTemplate,
}

/// An issuer instance: the credential formats it can mint and which zcap to
/// invoke for issuance (§3 "Workflow").
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerInstance {
    /// Credential formats (e.g. `"application/vc"`, `"jwt_vc_json"`) this
    /// instance can issue.
    pub supported_formats: Vec<String>,
    /// Reference ids into `Workflow::zcaps`.
    pub zcap_reference_ids: ZcapReferenceIds,
}

/// Reference ids into a workflow's zcap map, by purpose.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZcapReferenceIds {
    /// Reference id of the capability to invoke for `/credentials/issue`.
    pub issue: String,
}

/// A delegated authorization (zcap): an opaque, signed capability the engine
/// presents when invoking a remote issuer/verifier/status service (§4.3).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Zcap {
    /// The URL this capability authorizes invocation against.
    pub invocation_target: String,
    /// Opaque capability document, forwarded to the capability client
    /// verbatim.
    #[serde(flatten)]
    pub document: Value,
}

/// One entry of `step.issueRequests[]` (§4.5).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    /// Selects a credential template by position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_template_index: Option<usize>,
    /// Selects a credential template by id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_template_id: Option<String>,
    /// Either a dotted variable-path string selecting a sub-object of the
    /// scope, or an object to use as the variables directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// A dotted variable path to file the issued VC into, instead of
    /// returning it to the client (§4.5 step 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}
