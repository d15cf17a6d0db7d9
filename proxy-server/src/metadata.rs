//! C9 Health & Metadata surface: `/health`, `/.well-known/smart-configuration`,
//! and the `/metadata` CapabilityStatement OAuth-extension rewrite. Grounded
//! on the teacher's own `handlers/metadata.rs`, generalized from its static
//! JWT-config-derived document to one sourced from the configured issuer's
//! own OIDC discovery document.

use serde::Deserialize;
use serde_json::{Value, json};

use proxy_core::error::{ProxyError, Result};

use crate::config::AccessCheckerKind;

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    jwks_uri: Option<String>,
}

/// `GET /health` — liveness only, never touches the backend.
pub fn health() -> Value {
    json!({"status": "ok"})
}

/// `GET /.well-known/smart-configuration`. Fetches the configured issuer's
/// own discovery document for the three endpoint URIs and layers the fixed
/// SMART capability/scope lists named in §6 on top.
pub async fn smart_configuration(http: &reqwest::Client, token_issuer: &str, access_checker: AccessCheckerKind) -> Result<Value> {
    let discovery_url = format!("{}/.well-known/openid-configuration", token_issuer.trim_end_matches('/'));
    let response = http
        .get(&discovery_url)
        .send()
        .await
        .map_err(|e| ProxyError::Backend(format!("issuer discovery document fetch failed: {e}")))?;
    if !response.status().is_success() {
        return Err(ProxyError::Backend(format!(
            "issuer discovery document returned HTTP {}",
            response.status()
        )));
    }
    let discovery: OidcDiscovery = response
        .json()
        .await
        .map_err(|e| ProxyError::Backend(format!("issuer discovery document JSON parse failed: {e}")))?;

    Ok(json!({
        "issuer": token_issuer,
        "authorization_endpoint": discovery.authorization_endpoint,
        "token_endpoint": discovery.token_endpoint,
        "jwks_uri": discovery.jwks_uri,
        "grant_types_supported": ["authorization_code"],
        "code_challenge_methods_supported": ["S256"],
        "response_types_supported": ["code"],
        "capabilities": capabilities_for(access_checker),
        "scopes_supported": [
            "patient/*.read",
            "patient/*.write",
            "user/*.read",
            "user/*.write",
        ],
    }))
}

fn capabilities_for(access_checker: AccessCheckerKind) -> Vec<&'static str> {
    let mut capabilities = vec!["launch-standalone", "client-confidential-symmetric"];
    match access_checker {
        AccessCheckerKind::PatientCompartment => capabilities.push("permission-patient"),
        AccessCheckerKind::AccessList => capabilities.push("permission-v1"),
        AccessCheckerKind::Permission => capabilities.push("permission-v2"),
        AccessCheckerKind::SyncStrategy => capabilities.push("permission-v2"),
        AccessCheckerKind::Permissive => capabilities.push("permission-offline"),
    }
    capabilities
}

/// `/metadata` is proxied and then this is applied: inject an `OAuth`
/// `security` block into `CapabilityStatement.rest[0]` pointing at this
/// proxy's own smart-configuration document (§4.6). This is the one
/// response the pipeline parses rather than streams bytewise.
pub fn inject_security_extension(capability_statement: &mut Value, public_base_url: &str) -> Result<()> {
    let rest = capability_statement
        .get_mut("rest")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ProxyError::Backend("backend CapabilityStatement has no 'rest' array".into()))?;
    let first_rest = rest
        .first_mut()
        .ok_or_else(|| ProxyError::Backend("backend CapabilityStatement 'rest' array is empty".into()))?;

    first_rest["security"] = json!({
        "extension": [{
            "url": "http://fhir.org/guides/argonaut/StructureDefinition/oauth-uris",
            "extension": [
                {"url": "token", "valueUri": format!("{public_base_url}/.well-known/smart-configuration")}
            ]
        }],
        "service": [{
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/restful-security-service",
                "code": "SMART-on-FHIR",
                "display": "SMART on FHIR",
            }]
        }]
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reports_ok() {
        assert_eq!(health(), json!({"status": "ok"}));
    }

    #[test]
    fn capabilities_vary_by_checker() {
        assert!(capabilities_for(AccessCheckerKind::Permissive).contains(&"permission-offline"));
        assert!(capabilities_for(AccessCheckerKind::PatientCompartment).contains(&"permission-patient"));
    }

    #[test]
    fn inject_security_extension_requires_rest_array() {
        let mut capability = json!({"resourceType": "CapabilityStatement"});
        assert!(inject_security_extension(&mut capability, "http://proxy.example").is_err());
    }

    #[test]
    fn inject_security_extension_adds_security_block() {
        let mut capability = json!({"resourceType": "CapabilityStatement", "rest": [{"mode": "server"}]});
        inject_security_extension(&mut capability, "http://proxy.example").unwrap();
        assert!(capability["rest"][0]["security"]["service"][0]["coding"][0]["code"] == "SMART-on-FHIR");
    }
}
