//! # Issuance Engine (§4.5)
//!
//! Resolves which credential templates a step wants issued, evaluates
//! them against the exchange's variable scope, and invokes the matching
//! issuer capability in parallel. The engine never mints a credential
//! itself — construction and signing are the delegated issuer's job (§1).

use futures::future::try_join_all;
use serde_json::Value;

use crate::capability::{CapabilityClient, resolve_capability_url};
use crate::exchange::Exchange;
use crate::invalid;
use crate::template::{TemplateEvaluator, evaluate_template};
use crate::w3c_vc::VerifiablePresentation;
use crate::workflow::{CredentialTemplate, IssueRequest, Step, Workflow};
use crate::{Error, Result};

/// A single resolved request to evaluate a credential template and issue
/// its result (§4.5 `getIssueRequestParams`).
#[derive(Clone, Debug)]
pub struct IssueRequestParams {
    /// The template to evaluate.
    pub typed_template: crate::template::TypedTemplate,
    /// The scope to evaluate it against.
    pub variables: Value,
    /// Dotted variable path to file the result into instead of returning
    /// it, when set.
    pub result: Option<String>,
}

/// Resolves `step.issueRequests` (or the legacy single-step default) into a
/// list of [`IssueRequestParams`] (§4.5 `getIssueRequestParams`).
///
/// # Errors
/// Returns [`crate::Error::DataError`] if a request names an unknown
/// credential template, or a `variables` string path that isn't an object.
pub fn get_issue_request_params(
    workflow: &Workflow,
    exchange: &Exchange,
    step: &Step,
) -> Result<Vec<IssueRequestParams>> {
    if workflow.credential_templates.is_empty() {
        return Ok(Vec::new());
    }

    let globals = exchange.globals(&workflow.id);
    let full_scope = merge_globals(&exchange.variables, &globals);

    // Legacy path: no named steps, or the sole step declares no issueRequests.
    let legacy = workflow.steps.is_empty()
        || (workflow.steps.len() == 1 && step.issue_requests.is_none());
    if legacy {
        return workflow
            .credential_templates
            .iter()
            .map(|template| {
                Ok(IssueRequestParams {
                    typed_template: template.template.clone(),
                    variables: full_scope.clone(),
                    result: None,
                })
            })
            .collect();
    }

    let Some(requests) = &step.issue_requests else {
        return Ok(Vec::new());
    };
    requests
        .iter()
        .map(|request| resolve_one(workflow, &full_scope, request, &globals))
        .collect()
}

fn resolve_one(
    workflow: &Workflow,
    full_scope: &Value,
    request: &IssueRequest,
    globals: &Value,
) -> Result<IssueRequestParams> {
    let template = select_template(workflow, request)?;

    let variables = match &request.variables {
        None => full_scope.clone(),
        Some(Value::String(path)) => {
            let selected = full_scope
                .get(path)
                .ok_or_else(|| invalid!("issueRequests.variables '{path}' not found in scope"))?;
            if !selected.is_object() {
                return Err(invalid!("issueRequests.variables '{path}' does not select an object"));
            }
            merge_globals(selected, globals)
        }
        Some(object @ Value::Object(_)) => merge_globals(object, globals),
        Some(_) => return Err(invalid!("issueRequests.variables must be a string or object")),
    };

    Ok(IssueRequestParams {
        typed_template: template.template.clone(),
        variables,
        result: request.result.clone(),
    })
}

fn select_template<'a>(workflow: &'a Workflow, request: &IssueRequest) -> Result<&'a CredentialTemplate> {
    if let Some(id) = &request.credential_template_id {
        return workflow
            .credential_templates
            .iter()
            .find(|t| t.id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| invalid!("unknown credentialTemplateId '{id}'"));
    }
    if let Some(index) = request.credential_template_index {
        return workflow
            .credential_templates
            .get(index)
            .ok_or_else(|| invalid!("credentialTemplateIndex {index} out of range"));
    }
    Err(invalid!("issueRequests entry names neither credentialTemplateId nor credentialTemplateIndex"))
}

fn merge_globals(scope: &Value, globals: &Value) -> Value {
    let mut merged = scope.clone();
    if let Some(map) = merged.as_object_mut() {
        map.insert("globals".to_string(), globals.clone());
    }
    merged
}

/// A normalized issued credential, ready to be filed into variables or
/// appended to the response presentation.
struct Issued {
    credential: Value,
    result: Option<String>,
}

/// Outcome of [`issue`]: the response fragment to merge into the
/// processor's output, and whether exchange variables were mutated.
#[derive(Clone, Debug, Default)]
pub struct IssueOutcome {
    /// The presentation to return to the client, if anything was issued to
    /// it (as opposed to filed into variables).
    pub verifiable_presentation: Option<VerifiablePresentation>,
    /// `true` if any issued credential was filed into `exchange.variables`
    /// rather than returned.
    pub exchange_changed: bool,
}

/// Evaluates each `params` template, invokes the matching issuer capability
/// for `format`, and assembles the result (§4.5 `issue`).
///
/// # Errors
/// Returns [`crate::Error::Operation`] if an issuer capability invocation
/// fails, or [`crate::Error::DataError`] if no issuer instance supports
/// `format`.
pub async fn issue(
    workflow: &Workflow,
    exchange: &mut Exchange,
    evaluator: &impl TemplateEvaluator,
    capability_client: &impl CapabilityClient,
    format: &str,
    params: &[IssueRequestParams],
    seed_presentation: Option<&VerifiablePresentation>,
) -> Result<IssueOutcome> {
    if params.is_empty() {
        return Ok(IssueOutcome {
            verifiable_presentation: seed_presentation.cloned(),
            exchange_changed: false,
        });
    }

    let zcap_id = workflow
        .issue_zcap_for_format(format)
        .ok_or_else(|| invalid!("no issuer instance supports format '{format}'"))?;
    let zcap = workflow
        .zcaps
        .get(zcap_id)
        .ok_or_else(|| invalid!("zcap '{zcap_id}' not declared in workflow"))?;

    let evaluations = try_join_all(
        params.iter().map(|p| evaluate_template(evaluator, &p.typed_template, &p.variables)),
    )
    .await?;

    let issue_url = resolve_capability_url(&zcap.invocation_target);
    let issued = try_join_all(evaluations.into_iter().zip(params.iter()).map(
        |(evaluated, param)| {
            let issue_url = &issue_url;
            async move {
                let body = serde_json::json!({ "credential": evaluated });
                let response = capability_client.invoke(zcap, Some(issue_url.as_str()), &body).await?;
                let credential = response.get("credential").cloned().unwrap_or(response);
                Ok::<Issued, Error>(Issued { credential, result: param.result.clone() })
            }
        },
    ))
    .await?;

    let mut exchange_changed = false;
    let mut presentation = seed_presentation.cloned();

    for item in issued {
        if let Some(path) = &item.result {
            crate::template::set_variable(&mut exchange.variables, path, item.credential)?;
            exchange_changed = true;
        } else {
            let vp = presentation.get_or_insert_with(VerifiablePresentation::empty);
            vp.add_credential(crate::core::Kind::Object(item.credential));
        }
    }

    Ok(IssueOutcome { verifiable_presentation: presentation, exchange_changed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(src: &str) -> CredentialTemplate {
        CredentialTemplate {
            id: None,
            template: crate::template::TypedTemplate::Jsonata { template: src.to_string() },
        }
    }

    #[test]
    fn legacy_path_one_param_per_template() {
        let workflow = Workflow {
            id: "https://issuer.example/w/1".to_string(),
            initial_step: None,
            steps: Default::default(),
            credential_templates: vec![template("$"), template("$")],
            issuer_instances: Vec::new(),
            zcaps: Default::default(),
            oid4vp_client_profiles: None,
        };
        let exchange = Exchange::builder().id("zABC").expires(chrono::Utc::now()).build().unwrap();
        let params = get_issue_request_params(&workflow, &exchange, &Step::default()).unwrap();
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn rejects_unknown_credential_template_id() {
        let workflow = Workflow {
            id: "https://issuer.example/w/1".to_string(),
            initial_step: Some("s".to_string()),
            steps: [("s".to_string(), crate::workflow::StepOrTemplate::Static(Box::default()))]
                .into_iter()
                .collect(),
            credential_templates: vec![template("$")],
            issuer_instances: Vec::new(),
            zcaps: Default::default(),
            oid4vp_client_profiles: None,
        };
        let exchange = Exchange::builder().id("zABC").expires(chrono::Utc::now()).build().unwrap();
        let step = Step {
            issue_requests: Some(vec![IssueRequest {
                credential_template_index: None,
                credential_template_id: Some("missing".to_string()),
                variables: None,
                result: None,
            }]),
            ..Step::default()
        };
        let err = get_issue_request_params(&workflow, &exchange, &step).unwrap_err();
        assert!(matches!(err, Error::DataError(_)));
    }

    #[test]
    fn variables_string_path_must_select_object() {
        let workflow = Workflow {
            id: "https://issuer.example/w/1".to_string(),
            initial_step: Some("s".to_string()),
            steps: [("s".to_string(), crate::workflow::StepOrTemplate::Static(Box::default()))]
                .into_iter()
                .collect(),
            credential_templates: vec![template("$")],
            issuer_instances: Vec::new(),
            zcaps: Default::default(),
            oid4vp_client_profiles: None,
        };
        let mut exchange = Exchange::builder().id("zABC").expires(chrono::Utc::now()).build().unwrap();
        exchange.variables = json!({"name": "not an object"});
        let step = Step {
            issue_requests: Some(vec![IssueRequest {
                credential_template_index: Some(0),
                credential_template_id: None,
                variables: Some(json!("name")),
                result: None,
            }]),
            ..Step::default()
        };
        let err = get_issue_request_params(&workflow, &exchange, &step).unwrap_err();
        assert!(matches!(err, Error::DataError(_)));
    }

    #[tokio::test]
    async fn issue_invokes_the_resolved_credentials_issue_url() {
        use crate::test_utils::{FakeCapabilityClient, JsonEvaluator};
        use crate::workflow::{IssuerInstance, Zcap, ZcapReferenceIds};

        let mut zcaps = std::collections::HashMap::new();
        zcaps.insert(
            "issueCred".to_string(),
            Zcap { invocation_target: "https://issuer.example/credentials".to_string(), document: json!({}) },
        );
        let workflow = Workflow {
            id: "https://issuer.example/w/1".to_string(),
            initial_step: None,
            steps: Default::default(),
            credential_templates: vec![template(r#"{"type": "VerifiableCredential"}"#)],
            issuer_instances: vec![IssuerInstance {
                supported_formats: vec!["jwt_vc_json".to_string()],
                zcap_reference_ids: ZcapReferenceIds { issue: "issueCred".to_string() },
            }],
            zcaps,
            oid4vp_client_profiles: None,
        };
        let mut exchange = Exchange::builder().id("zABC").expires(chrono::Utc::now()).build().unwrap();
        let params = get_issue_request_params(&workflow, &exchange, &Step::default()).unwrap();

        let capability_client = FakeCapabilityClient::new();
        capability_client.respond(
            "https://issuer.example/credentials/issue",
            json!({"credential": {"type": "VerifiableCredential"}}),
        );

        let outcome =
            issue(&workflow, &mut exchange, &JsonEvaluator, &capability_client, "jwt_vc_json", &params, None)
                .await
                .unwrap();
        assert!(outcome.verifiable_presentation.is_some());
        assert_eq!(capability_client.invocations()[0].0, "https://issuer.example/credentials/issue");
    }
}
