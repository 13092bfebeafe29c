//! End-to-end scenarios driven against the in-memory test provider, one per
//! named scenario in the engine's testable-properties table.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use serde_json::json;
use vc_exchange::config::EngineConfig;
use vc_exchange::exchange::{Exchange, State};
use vc_exchange::oid4vci::credential::{CredentialOutcome, CredentialRequest};
use vc_exchange::oid4vci::token::TokenRequest;
use vc_exchange::oid4vci::{handle_credential_request, handle_token_request};
use vc_exchange::oid4vp::{
    get_authorization_request, process_authorization_response, AuthorizationResponseBody, ResponseDecryptor,
};
use vc_exchange::test_utils::{FakeCapabilityClient, MemoryStore, TestDidResolver, TestIdentity};
use vc_exchange::vcapi::process_vcapi_request;
use vc_exchange::workflow::{
    ClientProfile, CredentialTemplate, IssuerInstance, OpenIdStepConfig, Step, StepOrTemplate, Workflow,
    ZcapReferenceIds, Zcap,
};

const WORKFLOW_ID: &str = "https://issuer.example/workflows/w1";

/// Placeholder satisfying the `decryptor: Option<&impl ResponseDecryptor>`
/// parameter when a test never sends an encrypted (JARM) response.
struct NoDecryptor;

impl ResponseDecryptor for NoDecryptor {
    async fn decrypt(&self, _jwe: &str) -> vc_exchange::Result<serde_json::Value> {
        unreachable!("no test exercises encrypted authorization responses")
    }
}

fn did_authn_workflow() -> Workflow {
    let mut steps = HashMap::new();
    steps.insert(
        "didAuthn".to_string(),
        StepOrTemplate::Static(Box::new(Step {
            verifiable_presentation_request: Some(json!({
                "query": [{"type": "DIDAuthentication"}],
                "domain": "https://x",
            })),
            create_challenge: true,
            ..Step::default()
        })),
    );
    let mut zcaps = HashMap::new();
    zcaps.insert(
        "verifyPresentation".to_string(),
        Zcap { invocation_target: "https://verifier.example/verify".to_string(), document: json!({}) },
    );
    zcaps.insert(
        "issueCred".to_string(),
        Zcap { invocation_target: "https://issuer.example/issue".to_string(), document: json!({}) },
    );
    Workflow {
        id: WORKFLOW_ID.to_string(),
        initial_step: Some("didAuthn".to_string()),
        steps,
        credential_templates: vec![CredentialTemplate {
            id: None,
            template: vc_exchange::template::TypedTemplate::Jsonata { template: "$".to_string() },
        }],
        issuer_instances: vec![IssuerInstance {
            supported_formats: vec!["application/vc".to_string()],
            zcap_reference_ids: ZcapReferenceIds { issue: "issueCred".to_string() },
        }],
        zcaps,
        oid4vp_client_profiles: None,
    }
}

fn pending_exchange(id: &str) -> Exchange {
    Exchange::builder().id(id).expires(Utc::now() + Duration::minutes(15)).build().unwrap()
}

fn verify_response_for(holder: &TestIdentity) -> serde_json::Value {
    json!({
        "presentationResult": {
            "results": [{"verificationMethod": holder.verification_method_id()}],
        },
    })
}

// S1 (VC-API single call): one POST carrying a presentation completes the
// exchange and returns the issued credential in a single round trip.
#[tokio::test]
async fn s1_vcapi_single_call() {
    let workflow = did_authn_workflow();
    let config = EngineConfig::default();
    let store = MemoryStore::new();
    let capability_client = FakeCapabilityClient::new();
    let holder = TestIdentity::generate();
    let resolver = TestDidResolver::new();
    resolver.register(&holder);

    capability_client.respond("https://verifier.example/verify", verify_response_for(&holder));
    capability_client.respond(
        "https://issuer.example/issue",
        json!({"credential": {"@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": "VerifiableCredential",
            "credentialSubject": {"id": holder.did()}}}),
    );

    let exchange = pending_exchange("z1");
    let record = store.insert(&workflow.id, exchange.clone()).await.unwrap();

    let presentation = json!({
        "@context": ["https://www.w3.org/2018/credentials/v1"],
        "type": "VerifiablePresentation",
        "proof": {"challenge": exchange.id},
    });

    let outcome = process_vcapi_request(
        &workflow,
        &config,
        &workflow.id,
        &store,
        &vc_exchange::test_utils::JsonEvaluator,
        &capability_client,
        &resolver,
        record,
        Some(presentation),
    )
    .await
    .unwrap();

    let vp = outcome.verifiable_presentation.expect("issued credential should be present");
    let credentials = vp.verifiable_credential.expect("has credentials");
    let vc_exchange::core::Kind::Object(credential) = &credentials[0] else {
        panic!("expected object credential")
    };
    assert_eq!(credential["credentialSubject"]["id"], holder.did());

    let persisted = store.get(&workflow.id, "z1", false).await.unwrap();
    assert!(matches!(persisted.exchange.state, State::Complete));
}

// S2 (VC-API two-call): an empty POST returns a VPR with the exchange's own
// id as the challenge; a follow-up POST with the presentation completes it.
#[tokio::test]
async fn s2_vcapi_two_call() {
    let workflow = did_authn_workflow();
    let config = EngineConfig::default();
    let store = MemoryStore::new();
    let capability_client = FakeCapabilityClient::new();
    let holder = TestIdentity::generate();
    let resolver = TestDidResolver::new();
    resolver.register(&holder);

    capability_client.respond("https://verifier.example/verify", verify_response_for(&holder));
    capability_client.respond(
        "https://issuer.example/issue",
        json!({"credential": {"@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": "VerifiableCredential",
            "credentialSubject": {"id": holder.did()}}}),
    );

    let exchange = pending_exchange("z2");
    let record = store.insert(&workflow.id, exchange.clone()).await.unwrap();

    let first = process_vcapi_request(
        &workflow,
        &config,
        &workflow.id,
        &store,
        &vc_exchange::test_utils::JsonEvaluator,
        &capability_client,
        &resolver,
        record,
        None,
    )
    .await
    .unwrap();
    let vpr = first.verifiable_presentation_request.expect("VPR expected on empty first call");
    assert_eq!(vpr["challenge"], "z2");

    let record = store.get(&workflow.id, "z2", false).await.unwrap();
    let presentation = json!({
        "@context": ["https://www.w3.org/2018/credentials/v1"],
        "type": "VerifiablePresentation",
        "proof": {"challenge": "z2"},
    });
    let second = process_vcapi_request(
        &workflow,
        &config,
        &workflow.id,
        &store,
        &vc_exchange::test_utils::JsonEvaluator,
        &capability_client,
        &resolver,
        record,
        Some(presentation),
    )
    .await
    .unwrap();
    assert!(second.verifiable_presentation.is_some());

    let persisted = store.get(&workflow.id, "z2", false).await.unwrap();
    assert!(matches!(persisted.exchange.state, State::Complete));
}

// S3 (Replay): posting again after completion is rejected and the exchange
// record is left untouched.
#[tokio::test]
async fn s3_replay_after_complete_is_rejected() {
    let workflow = did_authn_workflow();
    let config = EngineConfig::default();
    let store = MemoryStore::new();
    let capability_client = FakeCapabilityClient::new();
    let holder = TestIdentity::generate();
    let resolver = TestDidResolver::new();
    resolver.register(&holder);

    capability_client.respond("https://verifier.example/verify", verify_response_for(&holder));
    capability_client.respond(
        "https://issuer.example/issue",
        json!({"credential": {"@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": "VerifiableCredential",
            "credentialSubject": {"id": holder.did()}}}),
    );

    let exchange = pending_exchange("z3");
    let record = store.insert(&workflow.id, exchange.clone()).await.unwrap();
    let presentation = json!({
        "@context": ["https://www.w3.org/2018/credentials/v1"],
        "type": "VerifiablePresentation",
        "proof": {"challenge": exchange.id},
    });
    process_vcapi_request(
        &workflow,
        &config,
        &workflow.id,
        &store,
        &vc_exchange::test_utils::JsonEvaluator,
        &capability_client,
        &resolver,
        record,
        Some(presentation),
    )
    .await
    .unwrap();

    let before = store.get(&workflow.id, "z3", false).await.unwrap();
    let replay_record = before.clone();
    let err = process_vcapi_request(
        &workflow,
        &config,
        &workflow.id,
        &store,
        &vc_exchange::test_utils::JsonEvaluator,
        &capability_client,
        &resolver,
        replay_record,
        Some(json!({})),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, vc_exchange::Error::NotAllowed(_)));

    let after = store.get(&workflow.id, "z3", false).await.unwrap();
    assert_eq!(before.exchange.sequence, after.exchange.sequence);
}

fn pre_auth_workflow() -> Workflow {
    let mut steps = HashMap::new();
    steps.insert("issue".to_string(), StepOrTemplate::Static(Box::new(Step::default())));
    let mut zcaps = HashMap::new();
    zcaps.insert(
        "issueCred".to_string(),
        Zcap { invocation_target: "https://issuer.example/issue".to_string(), document: json!({}) },
    );
    Workflow {
        id: WORKFLOW_ID.to_string(),
        initial_step: Some("issue".to_string()),
        steps,
        credential_templates: vec![CredentialTemplate {
            id: None,
            template: vc_exchange::template::TypedTemplate::Jsonata { template: "$".to_string() },
        }],
        issuer_instances: vec![IssuerInstance {
            supported_formats: vec!["jwt_vc_json".to_string()],
            zcap_reference_ids: ZcapReferenceIds { issue: "issueCred".to_string() },
        }],
        zcaps,
        oid4vp_client_profiles: None,
    }
}

// S4 (OID4VCI pre-auth happy path): token endpoint mints an access token for
// the pre-authorized code, then the credential endpoint issues against it.
#[tokio::test]
async fn s4_oid4vci_pre_authorized_happy_path() {
    let workflow = pre_auth_workflow();
    let config = EngineConfig::default();
    let store = MemoryStore::new();
    let capability_client = FakeCapabilityClient::new();
    let resolver = TestDidResolver::new();
    let evaluator = vc_exchange::test_utils::JsonEvaluator;

    let key_pair = vc_exchange::core::keypair::generate_ed25519();
    let exchange = Exchange::builder()
        .id("z4")
        .expires(Utc::now() + Duration::minutes(15))
        .open_id(vc_exchange::exchange::OpenIdState {
            pre_authorized_code: Some("ABC".to_string()),
            oauth2: Some(vc_exchange::exchange::Oauth2State { key_pair, max_clock_skew: None }),
            expected_credential_requests: vec![vc_exchange::exchange::ExpectedCredentialRequest {
                context: vec!["https://www.w3.org/2018/credentials/v1".to_string()],
                type_: vec!["VerifiableCredential".to_string(), "EmployeeId".to_string()],
            }],
        })
        .build()
        .unwrap();
    store.insert(&workflow.id, exchange).await.unwrap();

    let token_request = TokenRequest {
        grant_type: vc_exchange::oauth::GrantType::PreAuthorizedCode,
        pre_authorized_code: "ABC".to_string(),
    };
    let token = handle_token_request(&config, &workflow.id, &store, "z4", &token_request).await.unwrap();
    assert_eq!(token.token_type, "bearer");

    capability_client.respond(
        "https://issuer.example/issue",
        json!({"credential": {"@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": ["VerifiableCredential", "EmployeeId"], "credentialSubject": {"id": "did:example:holder"}}}),
    );

    let request = CredentialRequest {
        format: "jwt_vc_json".to_string(),
        credential_definition: json!({
            "@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": ["VerifiableCredential", "EmployeeId"],
        }),
        proof: None,
    };
    let outcome = handle_credential_request(
        &workflow,
        &workflow.id,
        &config,
        &store,
        &evaluator,
        &capability_client,
        &resolver,
        "z4",
        &token.access_token,
        &[request],
    )
    .await
    .unwrap();
    assert!(matches!(outcome, CredentialOutcome::Issued(_)));

    let persisted = store.get(&workflow.id, "z4", false).await.unwrap();
    assert!(matches!(persisted.exchange.state, State::Complete));
}

fn bridge_workflow() -> Workflow {
    let mut steps = HashMap::new();
    let mut profiles = HashMap::new();
    profiles.insert(
        "default".to_string(),
        ClientProfile {
            create_authorization_request: Some("authorizationRequest".to_string()),
            supports_oid4vp: true,
            ..ClientProfile::default()
        },
    );
    steps.insert(
        "issue".to_string(),
        StepOrTemplate::Static(Box::new(Step {
            open_id: Some(OpenIdStepConfig::Profiles { client_profiles: profiles }),
            verifiable_presentation_request: Some(json!({"query": [{"type": "DIDAuthentication"}]})),
            ..Step::default()
        })),
    );
    let mut zcaps = HashMap::new();
    zcaps.insert(
        "verifyPresentation".to_string(),
        Zcap { invocation_target: "https://verifier.example/verify".to_string(), document: json!({}) },
    );
    zcaps.insert(
        "issueCred".to_string(),
        Zcap { invocation_target: "https://issuer.example/issue".to_string(), document: json!({}) },
    );
    Workflow {
        id: WORKFLOW_ID.to_string(),
        initial_step: Some("issue".to_string()),
        steps,
        credential_templates: vec![CredentialTemplate {
            id: None,
            template: vc_exchange::template::TypedTemplate::Jsonata { template: "$".to_string() },
        }],
        issuer_instances: vec![IssuerInstance {
            supported_formats: vec!["jwt_vc_json".to_string()],
            zcap_reference_ids: ZcapReferenceIds { issue: "issueCred".to_string() },
        }],
        zcaps,
        oid4vp_client_profiles: None,
    }
}

// S5 (OID4VCI needs OID4VP): the first credential POST is turned away with
// presentation_required; after the wallet completes the OID4VP round trip,
// the retry succeeds.
#[tokio::test]
async fn s5_oid4vci_bridges_to_oid4vp() {
    let workflow = bridge_workflow();
    let config = EngineConfig::default();
    let store = MemoryStore::new();
    let capability_client = FakeCapabilityClient::new();
    let resolver = TestDidResolver::new();
    let evaluator = vc_exchange::test_utils::JsonEvaluator;
    let holder = TestIdentity::generate();

    let key_pair = vc_exchange::core::keypair::generate_ed25519();
    let exchange = Exchange::builder()
        .id("z5")
        .expires(Utc::now() + Duration::minutes(15))
        .open_id(vc_exchange::exchange::OpenIdState {
            pre_authorized_code: Some("ABC".to_string()),
            oauth2: Some(vc_exchange::exchange::Oauth2State { key_pair, max_clock_skew: None }),
            expected_credential_requests: Vec::new(),
        })
        .build()
        .unwrap();
    store.insert(&workflow.id, exchange.clone()).await.unwrap();

    let token_request = TokenRequest {
        grant_type: vc_exchange::oauth::GrantType::PreAuthorizedCode,
        pre_authorized_code: "ABC".to_string(),
    };
    let token = handle_token_request(&config, &workflow.id, &store, "z5", &token_request).await.unwrap();

    let exchange_path = format!("{}/exchanges/z5", workflow.id);
    let _authorization_request = get_authorization_request(
        &workflow,
        &config,
        &workflow.id,
        &store,
        &evaluator,
        "z5",
        &exchange_path,
        Some("default"),
    )
    .await
    .unwrap();

    let credential_request = || CredentialRequest {
        format: "jwt_vc_json".to_string(),
        credential_definition: json!({"type": ["VerifiableCredential"]}),
        proof: None,
    };

    let first = handle_credential_request(
        &workflow,
        &workflow.id,
        &config,
        &store,
        &evaluator,
        &capability_client,
        &resolver,
        "z5",
        &token.access_token,
        &[credential_request()],
    )
    .await
    .unwrap();
    assert!(matches!(first, CredentialOutcome::PresentationRequired(_)));

    capability_client.respond("https://verifier.example/verify", verify_response_for(&holder));
    let presentation = json!({
        "@context": ["https://www.w3.org/2018/credentials/v1"],
        "type": "VerifiablePresentation",
        "proof": {"challenge": "z5"},
    });
    let submission = json!({
        "id": "sub1",
        "definition_id": "pd1",
        "descriptor_map": [{"id": "d1", "format": "jwt_vp_json", "path": "$"}],
    });
    let body = AuthorizationResponseBody {
        response: None,
        vp_token: Some(presentation),
        presentation_submission: Some(submission),
    };
    let outcome = process_authorization_response(
        &workflow,
        &config,
        &workflow.id,
        &store,
        &evaluator,
        &capability_client,
        &resolver,
        None::<&NoDecryptor>,
        "z5",
        &exchange_path,
        Some("default"),
        &body,
    )
    .await
    .unwrap();
    assert!(outcome.redirect_uri.is_none());

    let recorded = store.get(&workflow.id, "z5", false).await.unwrap();
    assert!(
        recorded
            .exchange
            .variables
            .pointer("/results/issue/openId/presentationSubmission")
            .is_some()
    );

    capability_client.respond(
        "https://issuer.example/issue",
        json!({"credential": {"@context": ["https://www.w3.org/2018/credentials/v1"],
            "type": "VerifiableCredential", "credentialSubject": {"id": holder.did()}}}),
    );
    let second = handle_credential_request(
        &workflow,
        &workflow.id,
        &config,
        &store,
        &evaluator,
        &capability_client,
        &resolver,
        "z5",
        &token.access_token,
        &[credential_request()],
    )
    .await
    .unwrap();
    assert!(matches!(second, CredentialOutcome::Issued(_)));

    let persisted = store.get(&workflow.id, "z5", false).await.unwrap();
    assert!(matches!(persisted.exchange.state, State::Complete));
}

// S6 (Conflicting parallel completes): exactly one of two concurrent
// `complete()` calls at the same sequence succeeds; the loser observes
// Duplicate and the record ends invalid.
#[tokio::test]
async fn s6_conflicting_parallel_completes() {
    let store = MemoryStore::new();
    let exchange = pending_exchange("z6");
    store.insert(WORKFLOW_ID, exchange.clone()).await.unwrap();

    let mut a = exchange.clone();
    a.sequence = 1;
    a.state = State::Complete;
    let mut b = exchange;
    b.sequence = 1;
    b.state = State::Complete;

    let first = store.complete(WORKFLOW_ID, a).await;
    let second = store.complete(WORKFLOW_ID, b).await;

    assert!(first.is_ok());
    assert!(matches!(second.unwrap_err(), vc_exchange::Error::Duplicate(_)));

    let persisted = store.get(WORKFLOW_ID, "z6", true).await.unwrap();
    assert!(matches!(persisted.exchange.state, State::Invalid));
    let expected_expires = chrono::Utc::now() + chrono::Duration::days(3);
    assert!((persisted.meta.expires - expected_expires).num_seconds().abs() < 5);
}
