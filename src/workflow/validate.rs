//! # Workflow Structural Validation (C11, §4.11)
//!
//! Run at workflow create/update time, independently of whichever CRUD
//! surface constructs the document — mirroring the teacher's
//! `CreateOfferRequest::verify` pattern of a dedicated `verify` method that
//! runs ahead of a handler's core logic.

use crate::config::EngineConfig;
use crate::core::generate::is_multibase_multihash_128;
use crate::invalid;
use crate::workflow::{Step, StepOrTemplate, Workflow};
use crate::Result;

/// Validates `workflow`'s structural invariants (§4.11).
///
/// # Errors
/// Returns [`crate::Error::DataError`] carrying a field path identifying
/// the first rule violated.
pub fn validate(config: &EngineConfig, workflow: &Workflow) -> Result<()> {
    validate_issuance_wiring(workflow)?;
    validate_initial_step(workflow)?;
    validate_id(workflow)?;
    validate_limits(config, workflow)?;
    validate_steps(workflow)?;
    Ok(())
}

/// `credentialTemplates[]` non-empty ⇒ every issuer instance names a zcap
/// that is actually declared (§4.11 rule 1).
fn validate_issuance_wiring(workflow: &Workflow) -> Result<()> {
    if workflow.credential_templates.is_empty() {
        return Ok(());
    }
    if workflow.issuer_instances.is_empty() {
        return Err(invalid!("workflow.issuerInstances: required when credentialTemplates is non-empty"));
    }
    for (i, instance) in workflow.issuer_instances.iter().enumerate() {
        let reference_id = &instance.zcap_reference_ids.issue;
        if !workflow.zcaps.contains_key(reference_id) {
            return Err(invalid!(
                "workflow.issuerInstances[{i}].zcapReferenceIds.issue: '{reference_id}' not found in workflow.zcaps"
            ));
        }
    }
    Ok(())
}

/// `steps` set ⇒ `initialStep` set and present as a key of `steps` (§4.11
/// rule 2).
fn validate_initial_step(workflow: &Workflow) -> Result<()> {
    if workflow.steps.is_empty() {
        return Ok(());
    }
    let Some(initial) = &workflow.initial_step else {
        return Err(invalid!("workflow.initialStep: required when workflow.steps is non-empty"));
    };
    if !workflow.steps.contains_key(initial) {
        return Err(invalid!("workflow.initialStep: '{initial}' is not a key of workflow.steps"));
    }
    Ok(())
}

/// `id` (when client-provided) matches `<baseUri><routePrefix>/<localId>`
/// with `localId` a base58-multibase-multihash-encoded 128-bit value
/// (§4.11 rule 3).
fn validate_id(workflow: &Workflow) -> Result<()> {
    let local_id = workflow
        .id
        .rsplit('/')
        .next()
        .ok_or_else(|| invalid!("workflow.id: malformed URL"))?;
    if !is_multibase_multihash_128(local_id) {
        return Err(invalid!(
            "workflow.id: local id '{local_id}' is not a base58-multibase-multihash-encoded 128-bit value"
        ));
    }
    Ok(())
}

/// At most `config.max_issuer_instances` issuer instances; at most
/// `config.max_client_profiles` OID4VP client profiles (§4.11 rule 4,
/// §4.13).
fn validate_limits(config: &EngineConfig, workflow: &Workflow) -> Result<()> {
    if workflow.issuer_instances.len() > config.max_issuer_instances {
        return Err(invalid!(
            "workflow.issuerInstances: at most {} entries allowed, got {}",
            config.max_issuer_instances,
            workflow.issuer_instances.len()
        ));
    }
    if let Some(profiles) = &workflow.oid4vp_client_profiles
        && profiles.len() > config.max_client_profiles
    {
        return Err(invalid!(
            "workflow.oid4vpClientProfiles: at most {} entries allowed, got {}",
            config.max_client_profiles,
            profiles.len()
        ));
    }
    Ok(())
}

/// Each static step obeys the structural invariants of §4.6 step 4a: no
/// cyclical `nextStep`, no `redirectUrl`+`nextStep` together, no step
/// resolving to an empty object (§4.11 rule 5).
fn validate_steps(workflow: &Workflow) -> Result<()> {
    for (name, entry) in &workflow.steps {
        let StepOrTemplate::Static(step) = entry else {
            continue;
        };
        validate_static_step(name, step)?;
    }
    Ok(())
}

fn validate_static_step(name: &str, step: &Step) -> Result<()> {
    if step.next_step.as_deref() == Some(name) {
        return Err(invalid!("workflow.steps.{name}.nextStep: must not name its own step"));
    }
    if step.next_step.is_some() && step.redirect_url.is_some() {
        return Err(invalid!("workflow.steps.{name}: nextStep and redirectUrl are mutually exclusive"));
    }
    if is_empty_step(step) {
        return Err(invalid!("workflow.steps.{name}: resolves to an empty step"));
    }
    Ok(())
}

fn is_empty_step(step: &Step) -> bool {
    step.verifiable_presentation_request.is_none()
        && step.verifiable_presentation.is_none()
        && step.issue_requests.is_none()
        && step.open_id.is_none()
        && step.invite_request.is_none()
        && step.next_step.is_none()
        && step.redirect_url.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generate::exchange_id;
    use std::collections::HashMap;

    fn workflow_with_id(local_id: &str) -> Workflow {
        Workflow {
            id: format!("https://issuer.example/workflows/{local_id}"),
            initial_step: None,
            steps: HashMap::new(),
            credential_templates: Vec::new(),
            issuer_instances: Vec::new(),
            zcaps: HashMap::new(),
            oid4vp_client_profiles: None,
        }
    }

    #[test]
    fn accepts_generated_id() {
        let id = exchange_id();
        let workflow = workflow_with_id(&id);
        assert!(validate(&EngineConfig::default(), &workflow).is_ok());
    }

    #[test]
    fn rejects_non_multibase_id() {
        let workflow = workflow_with_id("not-a-multihash");
        let err = validate(&EngineConfig::default(), &workflow).unwrap_err();
        assert!(matches!(err, crate::Error::DataError(_)));
    }

    #[test]
    fn requires_initial_step_when_steps_present() {
        let mut workflow = workflow_with_id(&exchange_id());
        workflow.steps.insert("s1".to_string(), StepOrTemplate::Static(Box::default()));
        let err = validate(&EngineConfig::default(), &workflow).unwrap_err();
        assert!(matches!(err, crate::Error::DataError(_)));
    }

    #[test]
    fn rejects_cyclical_next_step() {
        let mut workflow = workflow_with_id(&exchange_id());
        workflow.initial_step = Some("s1".to_string());
        workflow.steps.insert(
            "s1".to_string(),
            StepOrTemplate::Static(Box::new(Step {
                next_step: Some("s1".to_string()),
                verifiable_presentation: Some(serde_json::json!({})),
                ..Step::default()
            })),
        );
        let err = validate(&EngineConfig::default(), &workflow).unwrap_err();
        assert!(matches!(err, crate::Error::DataError(_)));
    }

    #[test]
    fn honors_configured_issuer_instance_limit_rather_than_a_fixed_default() {
        use crate::workflow::{IssuerInstance, ZcapReferenceIds};

        let mut workflow = workflow_with_id(&exchange_id());
        workflow.zcaps.insert(
            "issueCred".to_string(),
            crate::workflow::Zcap { invocation_target: "https://issuer.example".to_string(), document: serde_json::json!({}) },
        );
        workflow.issuer_instances = (0..3)
            .map(|_| IssuerInstance {
                supported_formats: vec!["jwt_vc_json".to_string()],
                zcap_reference_ids: ZcapReferenceIds { issue: "issueCred".to_string() },
            })
            .collect();

        let permissive = EngineConfig { max_issuer_instances: 3, ..EngineConfig::default() };
        assert!(validate(&permissive, &workflow).is_ok());

        let strict = EngineConfig { max_issuer_instances: 2, ..EngineConfig::default() };
        let err = validate(&strict, &workflow).unwrap_err();
        assert!(matches!(err, crate::Error::DataError(_)));
    }
}
