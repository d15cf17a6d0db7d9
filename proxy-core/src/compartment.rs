use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ProxyError, Result};

const COMPARTMENT_DEFINITION_JSON: &str =
    include_str!("../resources/CompartmentDefinition-patient.json");

/// Immutable mapping from FHIR resource type to the ordered list of search-parameter
/// names that, per the FHIR R4 Patient-compartment definition, carry a Patient
/// reference (e.g. Observation → ["subject", "performer"]).
///
/// Loaded once at process start from the embedded `CompartmentDefinition-patient.json`;
/// there is no mutation after construction, so concurrent reads need no synchronization.
#[derive(Debug, Clone)]
pub struct CompartmentMap {
    params: HashMap<String, Vec<String>>,
}

impl CompartmentMap {
    /// Parse the embedded FHIR R4 `CompartmentDefinition` for Patient. A failure
    /// here is a `ConfigError` — the embedded resource is part of the binary and
    /// a parse failure means the binary itself is broken, not the deployment.
    pub fn from_embedded() -> Result<Self> {
        Self::from_json_str(COMPARTMENT_DEFINITION_JSON)
    }

    fn from_json_str(raw: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(raw)
            .map_err(|e| ProxyError::Config(format!("invalid CompartmentDefinition JSON: {e}")))?;

        let entries = doc
            .get("resource")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ProxyError::Config("CompartmentDefinition missing 'resource' array".into())
            })?;

        let mut params = HashMap::new();
        for entry in entries {
            let code = entry
                .get("code")
                .and_then(Value::as_str)
                .ok_or_else(|| ProxyError::Config("compartment entry missing 'code'".into()))?;
            let param_list = entry
                .get("param")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            params.insert(code.to_string(), param_list);
        }

        Ok(Self { params })
    }

    /// Whether a resource type is part of the Patient compartment at all.
    pub fn is_in_compartment(&self, resource_type: &str) -> bool {
        self.params.contains_key(resource_type)
    }

    /// Search-parameter names that scope this resource type to a Patient.
    /// `None` if the resource type is not in the compartment.
    pub fn params_for(&self, resource_type: &str) -> Option<&[String]> {
        self.params.get(resource_type).map(Vec::as_slice)
    }

    /// Whether `param_name` is one of this resource type's patient-compartment
    /// search parameters (used by the inspector to flag compartment-restricted
    /// references that lack an explicit `Patient/` type prefix).
    pub fn is_compartment_param(&self, resource_type: &str, param_name: &str) -> bool {
        self.params_for(resource_type)
            .is_some_and(|p| p.iter().any(|p| p == param_name))
    }

    /// Check whether a parsed resource body belongs to `patient_id`, by id match
    /// (for `Patient` itself) or by matching one of the compartment reference
    /// fields against `Patient/{patient_id}` (fields may hold a single reference
    /// object or an array of them, matching FHIR's 0..* cardinality).
    pub fn resource_belongs_to_patient(
        &self,
        resource_type: &str,
        resource: &Value,
        patient_id: &str,
    ) -> bool {
        let Some(fields) = self.params.get(resource_type) else {
            return false;
        };

        if resource_type == "Patient" {
            return resource
                .get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| id == patient_id);
        }

        let expected_ref = format!("Patient/{patient_id}");
        for field in fields {
            let Some(value) = resource.get(field.as_str()) else {
                continue;
            };
            if reference_matches(value, &expected_ref) {
                return true;
            }
        }

        false
    }
}

fn reference_matches(value: &Value, expected_ref: &str) -> bool {
    match value {
        Value::Object(_) => value
            .get("reference")
            .and_then(Value::as_str)
            .is_some_and(|r| r == expected_ref),
        Value::Array(items) => items.iter().any(|item| reference_matches(item, expected_ref)),
        _ => false,
    }
}
