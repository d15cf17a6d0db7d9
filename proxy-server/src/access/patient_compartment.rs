//! Patient-compartment checker (§4.4.1). Reads the token's `patient_id`
//! claim and grants only operations scoped to that one patient, per the
//! decision table in §4.4.1; additionally gated by SMART scopes when the
//! token carries a `scope` claim.

use serde_json::Value;

use proxy_core::decision::{AccessDecision, DecodedToken};
use proxy_core::error::{ProxyError, Result};
use proxy_core::inspector::ResourceInspector;
use proxy_core::request_view::{RequestMethod, RequestView};
use proxy_core::scope::{self, Principal};

#[derive(Debug, Clone, Copy, Default)]
pub struct PatientCompartmentChecker;

impl PatientCompartmentChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn check(
        &self,
        view: &RequestView,
        token: &DecodedToken,
        inspector: &ResourceInspector,
    ) -> Result<AccessDecision> {
        let claim_patient = token
            .claim_str("patient_id")
            .ok_or_else(|| ProxyError::Denied("token carries no patient_id claim".into()))?;

        let decision = self.decide(view, claim_patient, inspector)?;
        if decision.is_denied() {
            return Ok(decision);
        }

        if let Some(scope_str) = token.claim_str("scope")
            && !scope_permits(view, scope_str)
        {
            return Ok(AccessDecision::denied("token scope does not grant this operation"));
        }

        Ok(decision)
    }

    fn decide(&self, view: &RequestView, claim_patient: &str, inspector: &ResourceInspector) -> Result<AccessDecision> {
        let Some(resource_type) = view.resource_type.as_deref() else {
            let bundle = parse_body(view)?;
            let bundle_patients = inspector.inspect_bundle(&bundle)?;
            return Ok(grant_if(
                bundle_patients.single_patient_authorized(claim_patient),
                "bundle touches a patient outside the caller's compartment",
            ));
        };

        match (view.method, resource_type, view.resource_id.as_deref()) {
            (RequestMethod::Get, "Patient", Some(id)) => {
                Ok(grant_if(id == claim_patient, "patient id does not match token claim"))
            }
            (RequestMethod::Delete, "Patient", _) => {
                Ok(AccessDecision::denied("patient-compartment checker does not permit deleting patients"))
            }
            (RequestMethod::Post, "Patient", _) => {
                Ok(AccessDecision::denied("patient-compartment checker does not mint new patients"))
            }
            (RequestMethod::Put, "Patient", Some(id)) => {
                Ok(grant_if(id == claim_patient, "patient id does not match token claim"))
            }
            (RequestMethod::Put, "Patient", None) => {
                Ok(AccessDecision::denied("PUT Patient requires an id"))
            }
            (RequestMethod::Get, _, _) | (RequestMethod::Delete, _, _) => {
                let ids = inspector.patients_in_query(resource_type, view);
                Ok(grant_if(
                    !ids.is_empty() && ids.iter().all(|id| id == claim_patient),
                    "search parameters reference a patient outside the caller's compartment",
                ))
            }
            (RequestMethod::Post, _, _) => {
                let body = parse_body(view)?;
                let ids = inspector.patients_in_resource(resource_type, &body);
                Ok(grant_if(
                    ids.contains(claim_patient),
                    "created resource does not reference the caller's patient",
                ))
            }
            (RequestMethod::Put, _, _) => {
                let body = parse_body(view)?;
                let body_ids = inspector.patients_in_resource(resource_type, &body);
                let query_ids = inspector.patients_in_query(resource_type, view);
                let granted = body_ids.contains(claim_patient) && (query_ids.is_empty() || query_ids.contains(claim_patient));
                Ok(grant_if(
                    granted,
                    "update does not reference the caller's patient in both body and query",
                ))
            }
            (RequestMethod::Patch, _, _) => {
                let ops = parse_patch_body(view)?;
                let ids = inspector.patients_in_json_patch(resource_type, &ops)?;
                Ok(grant_if(
                    ids.contains(claim_patient),
                    "patch does not reference the caller's patient",
                ))
            }
        }
    }
}

fn scope_permits(view: &RequestView, scope_str: &str) -> bool {
    let scopes = scope::parse_scope_claim(scope_str);
    let resource_type = view.resource_type.as_deref().unwrap_or("Bundle");
    let is_search = view.method == RequestMethod::Get && view.resource_id.is_none();
    let required = scope::required_permission(view.method, is_search);
    scopes
        .iter()
        .any(|s| s.matches(Principal::Patient, resource_type, required) || s.matches(Principal::User, resource_type, required))
}

fn grant_if(condition: bool, reason: &str) -> AccessDecision {
    if condition {
        AccessDecision::granted()
    } else {
        AccessDecision::denied(reason.to_string())
    }
}

fn parse_body(view: &RequestView) -> Result<Value> {
    let body = view
        .body()
        .ok_or_else(|| ProxyError::InvalidRequest("request body is required".into()))?;
    serde_json::from_slice(body).map_err(|e| ProxyError::InvalidRequest(format!("malformed JSON body: {e}")))
}

fn parse_patch_body(view: &RequestView) -> Result<Vec<Value>> {
    let value = parse_body(view)?;
    value
        .as_array()
        .cloned()
        .ok_or_else(|| ProxyError::InvalidRequest("JSON-Patch body must be an array".into()))
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

    fn token_for(patient_id: &str) -> DecodedToken {
        let mut claims = HashMap::new();
        claims.insert("patient_id".to_string(), json!(patient_id));
        DecodedToken {
            issuer: "iss".into(),
            subject: "sub".into(),
            expiry: None,
            claims,
        }
    }

    #[test]
    fn get_own_patient_is_granted() {
        let view = RequestView {
            resource_type: Some("Patient".to_string()),
            resource_id: Some("p1".to_string()),
            ..RequestView::new(RequestMethod::Get, "/Patient/p1", "http://x/Patient/p1")
        };
        let decision = PatientCompartmentChecker::new().check(&view, &token_for("p1"), &inspector()).unwrap();
        assert_eq!(decision, AccessDecision::granted());
    }

    #[test]
    fn get_other_patient_is_denied() {
        let view = RequestView {
            resource_type: Some("Patient".to_string()),
            resource_id: Some("p2".to_string()),
            ..RequestView::new(RequestMethod::Get, "/Patient/p2", "http://x/Patient/p2")
        };
        let decision = PatientCompartmentChecker::new().check(&view, &token_for("p1"), &inspector()).unwrap();
        assert!(decision.is_denied());
    }

    #[test]
    fn post_new_patient_is_always_denied() {
        let mut view = RequestView {
            resource_type: Some("Patient".to_string()),
            ..RequestView::new(RequestMethod::Post, "/Patient", "http://x/Patient")
        };
        view = view.with_body(b"{}".to_vec());
        let decision = PatientCompartmentChecker::new().check(&view, &token_for("p1"), &inspector()).unwrap();
        assert!(decision.is_denied());
    }

    #[test]
    fn search_requires_every_candidate_to_match_claim() {
        let mut view = RequestView {
            resource_type: Some("Observation".to_string()),
            ..RequestView::new(RequestMethod::Get, "/Observation", "http://x/Observation")
        };
        view.query_params.push(("subject".to_string(), vec!["p1,p2".to_string()]));
        let decision = PatientCompartmentChecker::new().check(&view, &token_for("p1"), &inspector()).unwrap();
        assert!(decision.is_denied());
    }

    #[test]
    fn missing_patient_id_claim_is_denied() {
        let view = RequestView::new(RequestMethod::Get, "/Patient/p1", "http://x/Patient/p1");
        let token = DecodedToken {
            issuer: "iss".into(),
            subject: "sub".into(),
            expiry: None,
            claims: HashMap::new(),
        };
        let err = PatientCompartmentChecker::new().check(&view, &token, &inspector());
        assert!(err.is_err());
    }
}
