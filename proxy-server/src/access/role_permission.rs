//! Role/Permission checker (§4.4.4). Reads the token's `realm_access.roles`
//! claim and maps the requested method and resource type to a single
//! required role name.

use serde_json::Value;

use proxy_core::decision::{AccessDecision, DecodedToken};
use proxy_core::error::{ProxyError, Result};
use proxy_core::inspector::ResourceInspector;
use proxy_core::request_view::{RequestMethod, RequestView};

#[derive(Debug, Clone, Copy, Default)]
pub struct RolePermissionChecker;

impl RolePermissionChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, view: &RequestView, token: &DecodedToken, inspector: &ResourceInspector) -> Result<AccessDecision> {
        let roles = token.realm_roles();
        if roles.is_empty() {
            return Ok(AccessDecision::denied("token carries no realm_access.roles claim"));
        }

        let Some(resource_type) = view.resource_type.as_deref() else {
            let bundle = parse_body(view)?;
            return self.check_bundle(&bundle, &roles);
        };

        let required = required_role(view.method, resource_type);
        if !has_role(&roles, resource_type, &required) {
            return Ok(AccessDecision::denied(format!("token lacks role '{required}' (or its manage equivalent)")));
        }

        if view.method == RequestMethod::Put && resource_type != "Patient" {
            let id_part = view
                .resource_id
                .as_deref()
                .ok_or_else(|| ProxyError::InvalidRequest("PUT requires a resource id".into()))?;
            let body = parse_body(view)?;
            let ids = inspector.patients_in_resource(resource_type, &body);
            if !ids.contains(id_part) {
                return Ok(AccessDecision::denied(
                    "update's resource body does not reference the id being updated",
                ));
            }
        }

        Ok(AccessDecision::granted())
    }

    fn check_bundle(&self, bundle: &Value, roles: &[String]) -> Result<AccessDecision> {
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(ProxyError::InvalidRequest("body is not a Bundle".into()));
        }
        let entries = bundle.get("entry").and_then(Value::as_array).cloned().unwrap_or_default();
        for entry in &entries {
            let method = entry
                .get("request")
                .and_then(|r| r.get("method"))
                .and_then(Value::as_str)
                .and_then(RequestMethod::parse)
                .ok_or_else(|| ProxyError::InvalidRequest("Bundle entry has unsupported method".into()))?;
            let resource_type = entry
                .get("resource")
                .and_then(|r| r.get("resourceType"))
                .and_then(Value::as_str)
                .ok_or_else(|| ProxyError::InvalidRequest("Bundle entry resource missing resourceType".into()))?;
            let required = required_role(method, resource_type);
            if !has_role(roles, resource_type, &required) {
                return Ok(AccessDecision::denied(format!(
                    "token lacks role '{required}' required by a Bundle entry"
                )));
            }
        }
        Ok(AccessDecision::granted())
    }
}

fn required_role(method: RequestMethod, resource_type: &str) -> String {
    format!("{}_{}", method.as_str(), resource_type.to_ascii_uppercase())
}

fn has_role(roles: &[String], resource_type: &str, required: &str) -> bool {
    let manage = format!("MANAGE_{}", resource_type.to_ascii_uppercase());
    roles.iter().any(|r| r == required || r == &manage)
}

fn parse_body(view: &RequestView) -> Result<Value> {
    let body = view
        .body()
        .ok_or_else(|| ProxyError::InvalidRequest("request body is required".into()))?;
    serde_json::from_slice(body).map_err(|e| ProxyError::InvalidRequest(format!("malformed JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::compartment::CompartmentMap;
    use proxy_core::fhir_path::PatientFhirPathMap;
    use serde_json::json;
    use std::collections::HashMap;

    fn inspector() -> ResourceInspector {
        ResourceInspector::new(CompartmentMap::from_embedded().unwrap(), PatientFhirPathMap::from_embedded().unwrap())
    }

    fn token_with_roles(roles: &[&str]) -> DecodedToken {
        let mut claims = HashMap::new();
        claims.insert(
            "realm_access".to_string(),
            json!({"roles": roles.iter().map(|r| r.to_string()).collect::<Vec<_>>()}),
        );
        DecodedToken {
            issuer: "iss".into(),
            subject: "sub".into(),
            expiry: None,
            claims,
        }
    }

    #[test]
    fn exact_method_role_grants() {
        let view = RequestView {
            resource_type: Some("Observation".to_string()),
            resource_id: Some("o1".to_string()),
            ..RequestView::new(RequestMethod::Get, "/Observation/o1", "http://x/Observation/o1")
        };
        let token = token_with_roles(&["GET_OBSERVATION"]);
        let decision = RolePermissionChecker::new().check(&view, &token, &inspector()).unwrap();
        assert_eq!(decision, AccessDecision::granted());
    }

    #[test]
    fn manage_role_grants_any_method() {
        let view = RequestView {
            resource_type: Some("Observation".to_string()),
            ..RequestView::new(RequestMethod::Post, "/Observation", "http://x/Observation")
        };
        let token = token_with_roles(&["MANAGE_OBSERVATION"]);
        let decision = RolePermissionChecker::new().check(&view, &token, &inspector()).unwrap();
        assert_eq!(decision, AccessDecision::granted());
    }

    #[test]
    fn missing_role_is_denied() {
        let view = RequestView {
            resource_type: Some("Observation".to_string()),
            ..RequestView::new(RequestMethod::Get, "/Observation", "http://x/Observation")
        };
        let token = token_with_roles(&["GET_PATIENT"]);
        let decision = RolePermissionChecker::new().check(&view, &token, &inspector()).unwrap();
        assert!(decision.is_denied());
    }

    #[test]
    fn bundle_requires_every_entry_role() {
        let mut view = RequestView::new(RequestMethod::Post, "/", "http://x/");
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {"request": {"method": "POST"}, "resource": {"resourceType": "Observation"}},
                {"request": {"method": "POST"}, "resource": {"resourceType": "Patient"}}
            ]
        });
        view = view.with_body(serde_json::to_vec(&bundle).unwrap());
        let token = token_with_roles(&["POST_OBSERVATION"]);
        let decision = RolePermissionChecker::new().check(&view, &token, &inspector()).unwrap();
        assert!(decision.is_denied());
    }

    #[test]
    fn no_roles_claim_is_denied() {
        let view = RequestView::new(RequestMethod::Get, "/Observation/o1", "http://x/Observation/o1");
        let token = DecodedToken {
            issuer: "iss".into(),
            subject: "sub".into(),
            expiry: None,
            claims: HashMap::new(),
        };
        let decision = RolePermissionChecker::new().check(&view, &token, &inspector()).unwrap();
        assert!(decision.is_denied());
    }
}
