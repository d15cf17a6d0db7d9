//! A fixed, narrow fhir-path evaluator — not a general expression engine.
//!
//! [`PatientFhirPathMap`] holds, per resource type, a short list of dotted
//! field-path expressions (e.g. `"Observation.subject"`,
//! `"CareTeam.participant.member"`). Evaluating one against a parsed resource
//! walks the named fields, implicitly descending into arrays at each step —
//! the same `serde_json::Value` tree-walk idiom used elsewhere in this crate
//! for field retention and reference resolution, here turned toward
//! reference *extraction* instead.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{ProxyError, Result};

const PATIENT_PATHS_JSON: &str = include_str!("../resources/patient_paths.json");

/// Immutable mapping from FHIR resource type to the fhir-path expressions that
/// evaluate, on a parsed resource, to Patient references. Loaded once at
/// process start.
#[derive(Debug, Clone)]
pub struct PatientFhirPathMap {
    paths: HashMap<String, Vec<String>>,
}

impl PatientFhirPathMap {
    pub fn from_embedded() -> Result<Self> {
        let paths: HashMap<String, Vec<String>> = serde_json::from_str(PATIENT_PATHS_JSON)
            .map_err(|e| ProxyError::Config(format!("invalid patient_paths.json: {e}")))?;
        Ok(Self { paths })
    }

    pub fn expressions_for(&self, resource_type: &str) -> &[String] {
        self.paths
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A Reference value found while walking a fhir-path expression, together with
/// the final path segment it was found under (so callers can cross-check it
/// against a [`crate::compartment::CompartmentMap`] when the reference itself
/// carries no explicit resource-type prefix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundReference {
    pub field: String,
    pub type_hint: Option<String>,
    pub id: String,
}

/// Evaluate one dotted fhir-path expression against `resource`, returning every
/// Reference element found. `expression` always starts with the resource type
/// name (`"Observation.subject"`); that first segment is not itself a field
/// and is skipped before descending.
pub fn evaluate(expression: &str, resource: &Value) -> Vec<FoundReference> {
    let mut segments = expression.split('.');
    let _resource_type = segments.next();
    let remaining: Vec<&str> = segments.collect();
    if remaining.is_empty() {
        return Vec::new();
    }

    let mut found = Vec::new();
    walk(resource, &remaining, &mut found);
    found
}

fn walk(value: &Value, remaining: &[&str], found: &mut Vec<FoundReference>) {
    match value {
        Value::Array(items) => {
            for item in items {
                walk(item, remaining, found);
            }
        }
        Value::Object(_) => {
            let Some((field, rest)) = remaining.split_first() else {
                // Reached the end of the path: this object itself should be a Reference.
                if let Some(reference) = parse_reference_object(value) {
                    found.push(FoundReference {
                        field: String::new(),
                        type_hint: reference.0,
                        id: reference.1,
                    });
                }
                return;
            };
            if let Some(next) = value.get(*field) {
                if rest.is_empty() {
                    collect_terminal(next, field, found);
                } else {
                    walk(next, rest, found);
                }
            }
        }
        _ => {}
    }
}

fn collect_terminal(value: &Value, field: &str, found: &mut Vec<FoundReference>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_terminal(item, field, found);
            }
        }
        Value::Object(_) => {
            if let Some((type_hint, id)) = parse_reference_object(value) {
                found.push(FoundReference {
                    field: field.to_string(),
                    type_hint,
                    id,
                });
            }
        }
        _ => {}
    }
}

/// Parse `{"reference": "Patient/123"}` (optionally with a `/_history/{vid}`
/// suffix) into `(type_hint, id)`. Returns `None` for anything that isn't a
/// Reference-shaped object (no string `reference` field), and for contained
/// (`#`-prefixed) or absolute-URL references, which are not patient ids.
fn parse_reference_object(value: &Value) -> Option<(Option<String>, String)> {
    parse_reference_value(value)
}

/// Public entry point for callers outside the fhir-path walker (e.g. the
/// inspector's JSON-Patch handling) that need to classify a single
/// already-located value as a Reference.
pub fn parse_reference_value(value: &Value) -> Option<(Option<String>, String)> {
    let reference = value.get("reference")?.as_str()?;
    parse_reference_string(reference)
}

fn parse_reference_string(reference: &str) -> Option<(Option<String>, String)> {
    if reference.is_empty() || reference.starts_with('#') || reference.contains("://") {
        return None;
    }
    let without_history = reference.split("/_history/").next().unwrap_or(reference);
    match without_history.split_once('/') {
        Some((resource_type, id)) if !resource_type.is_empty() && !id.is_empty() => {
            Some((Some(resource_type.to_string()), id.to_string()))
        }
        _ => Some((None, without_history.to_string())),
    }
}
