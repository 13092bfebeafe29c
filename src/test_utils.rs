//! # Test Harness (C14, ambient)
//!
//! An in-memory [`Provider`](crate::capability::Provider) composition used
//! by this crate's own tests: a [`MemoryStore`] over a `Mutex<HashMap<...>>`,
//! a [`FakeCapabilityClient`] that records invocations and replays
//! registered responses, a [`JsonEvaluator`] standing in for a real JSONata
//! engine, and a [`TestDidResolver`] resolving `did:key` documents minted by
//! [`TestIdentity`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use credibil_did::document::{CreateOptions, Document};
use credibil_did::{DidKey, DidOperator, DidResolver, KeyPurpose};
use credibil_infosec::{Algorithm, Curve, KeyType, PublicKeyJwk, Signer};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};

use crate::capability::CapabilityClient;
use crate::exchange::store::{new_meta, Store};
use crate::exchange::{Exchange, ExchangeRecord, State};
use crate::template::{TemplateEvaluator, TypedTemplate};
use crate::workflow::Zcap;
use crate::{operation, Error, Result};

/// In-memory [`Store`] keyed by `(workflow_id, exchange.id)`, matching the
/// CAS discipline of §4.1 exactly enough to drive this crate's own tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<(String, String), ExchangeRecord>>>,
}

impl MemoryStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    async fn insert(&self, workflow_id: &str, exchange: Exchange) -> Result<ExchangeRecord> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let key = (workflow_id.to_string(), exchange.id.clone());
        if records.contains_key(&key) {
            return Err(Error::Duplicate(format!("exchange '{}' already exists", exchange.id)));
        }
        let record = ExchangeRecord { meta: new_meta(exchange.expires), exchange };
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn get(&self, workflow_id: &str, id: &str, allow_expired: bool) -> Result<ExchangeRecord> {
        let records = self.records.lock().expect("store mutex poisoned");
        let record = records
            .get(&(workflow_id.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no exchange '{id}'")))?;
        if !allow_expired
            && (record.meta.expires < Utc::now() || matches!(record.exchange.state, State::Invalid))
        {
            return Err(Error::NotFound(format!("no exchange '{id}'")));
        }
        Ok(record)
    }

    async fn update(&self, workflow_id: &str, exchange: Exchange) -> Result<ExchangeRecord> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let key = (workflow_id.to_string(), exchange.id.clone());
        let current = records
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("no exchange '{}'", exchange.id)))?;
        if current.exchange.is_terminal() || current.exchange.sequence + 1 != exchange.sequence {
            return Err(Error::InvalidState(format!("CAS mismatch updating '{}'", exchange.id)));
        }
        let meta = crate::exchange::Meta {
            created: current.meta.created,
            updated: Utc::now(),
            expires: current.meta.expires,
        };
        let record = ExchangeRecord { exchange, meta };
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn complete(&self, workflow_id: &str, exchange: Exchange) -> Result<ExchangeRecord> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let key = (workflow_id.to_string(), exchange.id.clone());
        let current = records
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no exchange '{}'", exchange.id)))?;

        if !current.exchange.is_terminal() && current.exchange.sequence + 1 == exchange.sequence {
            let meta = crate::exchange::Meta {
                created: current.meta.created,
                updated: Utc::now(),
                expires: current.meta.expires,
            };
            let record = ExchangeRecord { exchange, meta };
            records.insert(key, record.clone());
            return Ok(record);
        }

        if current.exchange.is_terminal() {
            drop(records);
            // Matches `EngineConfig::default().invalidated_record_ttl` (§4.1 `invalidate`).
            let _ = self.invalidate(workflow_id, &exchange.id, chrono::Duration::days(3)).await;
            return Err(Error::Duplicate(format!("exchange '{}' already complete", exchange.id)));
        }
        Err(Error::InvalidState(format!("CAS mismatch completing '{}'", exchange.id)))
    }

    async fn set_last_error(
        &self,
        workflow_id: &str,
        exchange: &Exchange,
        last_updated: DateTime<Utc>,
        rate_limit_count: u64,
        rate_limit_window: chrono::Duration,
    ) -> Result<()> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let Some(current) = records.get_mut(&(workflow_id.to_string(), exchange.id.clone())) else {
            return Ok(());
        };
        if exchange.sequence > rate_limit_count && last_updated - current.meta.updated < rate_limit_window {
            return Ok(());
        }
        current.exchange.last_error.clone_from(&exchange.last_error);
        current.meta.updated = last_updated;
        Ok(())
    }

    async fn invalidate(&self, workflow_id: &str, id: &str, ttl: chrono::Duration) -> Result<()> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        if let Some(record) = records.get_mut(&(workflow_id.to_string(), id.to_string())) {
            record.exchange.state = State::Invalid;
            record.meta.expires = Utc::now() + ttl;
        }
        Ok(())
    }
}

/// A [`CapabilityClient`] fake that records every invocation and replays a
/// response registered against the capability's `invocation_target`.
#[derive(Clone, Default)]
pub struct FakeCapabilityClient {
    invocations: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    responses: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl FakeCapabilityClient {
    /// Builds a client with no registered responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the response returned the next time `invocation_target`
    /// is invoked.
    pub fn respond(&self, invocation_target: impl Into<String>, response: serde_json::Value) {
        self.responses.lock().expect("responses mutex poisoned").insert(invocation_target.into(), response);
    }

    /// Every `(invocation_target, body)` pair passed to
    /// [`CapabilityClient::invoke`] so far, in call order.
    #[must_use]
    pub fn invocations(&self) -> Vec<(String, serde_json::Value)> {
        self.invocations.lock().expect("invocations mutex poisoned").clone()
    }
}

impl CapabilityClient for FakeCapabilityClient {
    async fn invoke(
        &self,
        zcap: &Zcap,
        url: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let target = url.unwrap_or(&zcap.invocation_target).to_string();
        self.invocations.lock().expect("invocations mutex poisoned").push((target.clone(), body.clone()));
        self.responses
            .lock()
            .expect("responses mutex poisoned")
            .get(&target)
            .cloned()
            .ok_or_else(|| operation!("no fake response registered for '{target}'"))
    }
}

/// A [`TemplateEvaluator`] stand-in for a real JSONata engine: `"$"`
/// returns `scope` unchanged, and any other template source is parsed as a
/// literal JSON value, so tests can exercise template-driven steps and
/// `createAuthorizationRequest` expressions without a JSONata dependency.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEvaluator;

impl TemplateEvaluator for JsonEvaluator {
    async fn evaluate(&self, template: &TypedTemplate, scope: &serde_json::Value) -> Result<serde_json::Value> {
        let source = template.source();
        if source.trim() == "$" {
            return Ok(scope.clone());
        }
        serde_json::from_str(source).map_err(|e| crate::invalid!("template did not parse as literal JSON: {e}"))
    }
}

/// A locally-generated Ed25519 `did:key` identity, grounded in the
/// teacher's `examples/kms` `Keyring`: implements [`DidOperator`] (so
/// [`DidKey::create`] can build its document) and [`Signer`] (so tests can
/// sign DID-proof JWTs with it).
#[derive(Clone)]
pub struct TestIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    document: Document,
}

impl TestIdentity {
    /// Generates a fresh key pair and its `did:key` document.
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::fill(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        let bootstrap = BootstrapOperator { verifying_key };
        let document =
            DidKey::create(&bootstrap, CreateOptions::default()).expect("did:key document should build");
        Self { signing_key, verifying_key, document }
    }

    /// The identity's `did:key:...` string.
    #[must_use]
    pub fn did(&self) -> String {
        self.document.id.clone()
    }

    /// The identity's first verification method id (`did#fragment`), the
    /// `kid` a DID-proof JWT should carry.
    #[must_use]
    pub fn verification_method_id(&self) -> String {
        self.document.verification_method.as_ref().expect("did:key document has a verification method")[0]
            .id
            .clone()
    }

    /// The generated document, for seeding a [`TestDidResolver`].
    #[must_use]
    pub fn document(&self) -> Document {
        self.document.clone()
    }
}

impl DidOperator for TestIdentity {
    fn verification(&self, purpose: KeyPurpose) -> Option<PublicKeyJwk> {
        match purpose {
            KeyPurpose::VerificationMethod => Some(public_key_jwk(&self.verifying_key)),
            _ => None,
        }
    }
}

impl Signer for TestIdentity {
    async fn try_sign(&self, msg: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.signing_key.sign(msg).to_bytes().to_vec())
    }

    async fn verifying_key(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.verifying_key.as_bytes().to_vec())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::EdDSA
    }

    async fn verification_method(&self) -> anyhow::Result<String> {
        Ok(self.verification_method_id())
    }
}

/// Resolves just enough of [`DidOperator`] to bootstrap a `did:key`
/// document before a [`TestIdentity`] exists to resolve itself.
struct BootstrapOperator {
    verifying_key: VerifyingKey,
}

impl DidOperator for BootstrapOperator {
    fn verification(&self, purpose: KeyPurpose) -> Option<PublicKeyJwk> {
        match purpose {
            KeyPurpose::VerificationMethod => Some(public_key_jwk(&self.verifying_key)),
            _ => None,
        }
    }
}

fn public_key_jwk(verifying_key: &VerifyingKey) -> PublicKeyJwk {
    PublicKeyJwk {
        kty: KeyType::Okp,
        crv: Curve::Ed25519,
        x: base64ct::Base64UrlUnpadded::encode_string(verifying_key.as_bytes()),
        ..PublicKeyJwk::default()
    }
}

/// Resolves `did:key` documents registered by [`TestDidResolver::register`].
#[derive(Clone, Default)]
pub struct TestDidResolver {
    documents: Arc<Mutex<HashMap<String, Document>>>,
}

impl TestDidResolver {
    /// Builds a resolver with no registered identities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `identity`'s document under its own DID.
    pub fn register(&self, identity: &TestIdentity) {
        self.documents.lock().expect("documents mutex poisoned").insert(identity.did(), identity.document());
    }
}

impl DidResolver for TestDidResolver {
    async fn resolve(&self, url: &str) -> anyhow::Result<Document> {
        let did = url.split('#').next().unwrap_or(url);
        self.documents
            .lock()
            .expect("documents mutex poisoned")
            .get(did)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("document not found for '{did}'"))
    }
}

/// Everything [`crate::capability::Provider`] needs, composed for tests.
#[derive(Clone, Default)]
pub struct TestProvider {
    store: MemoryStore,
    capability_client: FakeCapabilityClient,
    evaluator: JsonEvaluator,
    resolver: TestDidResolver,
}

impl TestProvider {
    /// Builds a fresh, empty test provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying fake capability client, for registering responses and
    /// inspecting invocations.
    #[must_use]
    pub const fn capability_client(&self) -> &FakeCapabilityClient {
        &self.capability_client
    }

    /// The underlying DID resolver, for registering test identities.
    #[must_use]
    pub const fn resolver(&self) -> &TestDidResolver {
        &self.resolver
    }
}

impl Store for TestProvider {
    async fn insert(&self, workflow_id: &str, exchange: Exchange) -> Result<ExchangeRecord> {
        self.store.insert(workflow_id, exchange).await
    }

    async fn get(&self, workflow_id: &str, id: &str, allow_expired: bool) -> Result<ExchangeRecord> {
        self.store.get(workflow_id, id, allow_expired).await
    }

    async fn update(&self, workflow_id: &str, exchange: Exchange) -> Result<ExchangeRecord> {
        self.store.update(workflow_id, exchange).await
    }

    async fn complete(&self, workflow_id: &str, exchange: Exchange) -> Result<ExchangeRecord> {
        self.store.complete(workflow_id, exchange).await
    }

    async fn set_last_error(
        &self,
        workflow_id: &str,
        exchange: &Exchange,
        last_updated: DateTime<Utc>,
        rate_limit_count: u64,
        rate_limit_window: chrono::Duration,
    ) -> Result<()> {
        self.store.set_last_error(workflow_id, exchange, last_updated, rate_limit_count, rate_limit_window).await
    }

    async fn invalidate(&self, workflow_id: &str, id: &str, ttl: chrono::Duration) -> Result<()> {
        self.store.invalidate(workflow_id, id, ttl).await
    }
}

impl TemplateEvaluator for TestProvider {
    async fn evaluate(&self, template: &TypedTemplate, scope: &serde_json::Value) -> Result<serde_json::Value> {
        self.evaluator.evaluate(template, scope).await
    }
}

impl CapabilityClient for TestProvider {
    async fn invoke(
        &self,
        zcap: &Zcap,
        url: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.capability_client.invoke(zcap, url, body).await
    }
}

impl DidResolver for TestProvider {
    async fn resolve(&self, url: &str) -> anyhow::Result<Document> {
        self.resolver.resolve(url).await
    }
}

/// Installs a `tracing` subscriber for test output, controlled by
/// `RUST_LOG` (default `debug`), matching the teacher's test-harness
/// logging convention.
pub fn init_tracer() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn store_insert_get_roundtrip() {
        let store = MemoryStore::new();
        let exchange = Exchange::builder().id("z1").expires(Utc::now() + chrono::Duration::minutes(5)).build().unwrap();
        store.insert("w1", exchange).await.unwrap();
        let record = store.get("w1", "z1", false).await.unwrap();
        assert_eq!(record.exchange.id, "z1");
    }

    #[tokio::test]
    async fn store_rejects_duplicate_insert() {
        let store = MemoryStore::new();
        let exchange = Exchange::builder().id("z1").expires(Utc::now()).build().unwrap();
        store.insert("w1", exchange.clone()).await.unwrap();
        let err = store.insert("w1", exchange).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[tokio::test]
    async fn store_update_enforces_cas() {
        let store = MemoryStore::new();
        let exchange = Exchange::builder().id("z1").expires(Utc::now() + chrono::Duration::minutes(5)).build().unwrap();
        store.insert("w1", exchange).await.unwrap();
        let mut record = store.get("w1", "z1", false).await.unwrap();
        record.exchange.sequence = 5;
        let err = store.update("w1", record.exchange).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn store_hides_expired_records_unless_allowed() {
        let store = MemoryStore::new();
        let exchange = Exchange::builder().id("z1").expires(Utc::now() - chrono::Duration::minutes(1)).build().unwrap();
        store.insert("w1", exchange).await.unwrap();
        assert!(matches!(store.get("w1", "z1", false).await.unwrap_err(), Error::NotFound(_)));
        assert!(store.get("w1", "z1", true).await.is_ok());
    }

    #[tokio::test]
    async fn fake_capability_client_replays_registered_response() {
        let client = FakeCapabilityClient::new();
        client.respond("https://verifier.example/verify", json!({"verified": true}));
        let zcap = Zcap { invocation_target: "https://verifier.example/verify".to_string(), document: json!({}) };
        let response = client.invoke(&zcap, None, &json!({"a": 1})).await.unwrap();
        assert_eq!(response["verified"], true);
        assert_eq!(client.invocations().len(), 1);
    }

    #[tokio::test]
    async fn json_evaluator_passes_scope_through_identity_template() {
        let evaluator = JsonEvaluator;
        let scope = json!({"a": 1});
        let result = evaluator
            .evaluate(&TypedTemplate::Jsonata { template: "$".to_string() }, &scope)
            .await
            .unwrap();
        assert_eq!(result, scope);
    }

    #[tokio::test]
    async fn json_evaluator_parses_literal_template() {
        let evaluator = JsonEvaluator;
        let result = evaluator
            .evaluate(&TypedTemplate::Jsonata { template: r#"{"nextStep": "s2"}"#.to_string() }, &json!({}))
            .await
            .unwrap();
        assert_eq!(result["nextStep"], "s2");
    }

    #[tokio::test]
    async fn test_identity_resolves_through_test_resolver() {
        let identity = TestIdentity::generate();
        let resolver = TestDidResolver::new();
        resolver.register(&identity);
        let kid = identity.verification_method_id();
        let resolved = resolver.resolve(&kid).await.unwrap();
        assert_eq!(resolved.id, identity.did());
    }
}
