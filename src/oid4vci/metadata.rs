//! # Metadata Documents (§4.8 "Metadata document keys")

use serde_json::{json, Map, Value};

use crate::exchange::Exchange;
use crate::workflow::Workflow;

/// Builds the `/.well-known/oauth-authorization-server` document for one
/// exchange's virtual authorization server.
///
/// `exchange_path` is `<workflowId>/exchanges/<exchangeId>`, precomputed by
/// the caller (route construction is the hosting process's job, §1).
#[must_use]
pub fn authorization_server(exchange_path: &str) -> Value {
    json!({
        "issuer": exchange_path,
        "token_endpoint": format!("{exchange_path}/openid/token"),
        "jwks_uri": format!("{exchange_path}/openid/jwks"),
        "grant_types_supported": ["urn:ietf:params:oauth:grant-type:pre-authorized_code"],
        "pre-authorized_grant_anonymous_access_supported": true,
    })
}

/// Builds the `/.well-known/openid-credential-issuer` document.
#[must_use]
pub fn credential_issuer(workflow: &Workflow, exchange: &Exchange, exchange_path: &str) -> Value {
    let formats = workflow.supported_formats();
    let mut configurations = Map::new();
    for request in &exchange.open_id.expected_credential_requests {
        for format in formats.iter().copied() {
            let id = configuration_id(&request.type_, format);
            configurations.insert(
                id,
                json!({
                    "format": format,
                    "credential_definition": {
                        "@context": request.context,
                        "type": request.type_,
                    },
                }),
            );
        }
    }

    json!({
        "credential_issuer": exchange_path,
        "issuer": exchange_path,
        "jwks_uri": format!("{exchange_path}/openid/jwks"),
        "token_endpoint": format!("{exchange_path}/openid/token"),
        "credential_endpoint": format!("{exchange_path}/openid/credential"),
        "batch_credential_endpoint": format!("{exchange_path}/openid/batch_credential"),
        "pre-authorized_grant_anonymous_access_supported": true,
        "credential_configurations_supported": Value::Object(configurations),
    })
}

/// A configuration id: `type.join("_") + "_" + format`, with
/// `"VerifiableCredential"` stripped when other types are present (§4.8).
#[must_use]
pub fn configuration_id(types: &[String], format: &str) -> String {
    let names: Vec<&str> = if types.len() > 1 {
        types.iter().filter(|t| t.as_str() != "VerifiableCredential").map(String::as_str).collect()
    } else {
        types.iter().map(String::as_str).collect()
    };
    format!("{}_{format}", names.join("_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_verifiable_credential_when_other_types_present() {
        let types = vec!["VerifiableCredential".to_string(), "UniversityDegreeCredential".to_string()];
        assert_eq!(configuration_id(&types, "jwt_vc_json"), "UniversityDegreeCredential_jwt_vc_json");
    }

    #[test]
    fn keeps_sole_type() {
        let types = vec!["VerifiableCredential".to_string()];
        assert_eq!(configuration_id(&types, "jwt_vc_json"), "VerifiableCredential_jwt_vc_json");
    }
}
