//! Resource Inspector (C2): extracts the set of Patient ids a request touches,
//! from a single resource body, a transaction Bundle, a JSON-Patch body, or
//! request query parameters.
//!
//! Every failure here is an [`ProxyError::InvalidRequest`] — per §4.2 the
//! inspector must never silently fall through to an empty set when it cannot
//! prove a resource is scoped; the access-checker then denies.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::compartment::CompartmentMap;
use crate::error::{ProxyError, Result};
use crate::fhir_path::PatientFhirPathMap;
use crate::request_view::{RequestMethod, RequestView};
use crate::search_query::{reference_value_id, SearchQuery};

pub type PatientId = String;

/// Bundles the two process-wide static tables the inspector needs, so callers
/// hold one handle instead of threading both through every call.
#[derive(Debug, Clone)]
pub struct ResourceInspector {
    compartment: CompartmentMap,
    fhir_paths: PatientFhirPathMap,
}

/// What a single transaction-Bundle entry turned out to do, in document order
/// (§4.2 Algorithm — Bundle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePatients {
    pub updated_patient_ids: Vec<PatientId>,
    pub creates_new_patient: bool,
    pub referenced_patient_sets: Vec<BTreeSet<PatientId>>,
}

impl BundlePatients {
    pub fn single_patient_authorized(&self, patient_id: &str) -> bool {
        if self.creates_new_patient {
            return false;
        }
        if self.updated_patient_ids.iter().any(|id| id != patient_id) {
            return false;
        }
        self.referenced_patient_sets
            .iter()
            .all(|set| set.contains(patient_id))
    }
}

impl ResourceInspector {
    pub fn new(compartment: CompartmentMap, fhir_paths: PatientFhirPathMap) -> Self {
        Self {
            compartment,
            fhir_paths,
        }
    }

    pub fn compartment(&self) -> &CompartmentMap {
        &self.compartment
    }

    /// §4.2 Algorithm — single resource. Returns the union of Patient ids
    /// found by evaluating every fhir-path expression registered for
    /// `resource_type`, accepting untyped references only when the field they
    /// were found under is itself compartment-restricted.
    pub fn patients_in_resource(&self, resource_type: &str, resource: &Value) -> BTreeSet<PatientId> {
        let mut found = BTreeSet::new();
        for expr in self.fhir_paths.expressions_for(resource_type) {
            for reference in crate::fhir_path::evaluate(expr, resource) {
                let is_patient = match reference.type_hint.as_deref() {
                    Some("Patient") => true,
                    Some(_) => false,
                    None => self.compartment.is_compartment_param(resource_type, &reference.field),
                };
                if is_patient {
                    found.insert(reference.id);
                }
            }
        }
        found
    }

    /// §4.2 Algorithm — search parameters. For each compartment-restricted
    /// parameter name carried in `view`'s (already modifier-validated) query
    /// parameters, extract its id-part as a candidate patient id;
    /// comma-separated multi-valued parameters are unioned.
    pub fn patients_in_query(&self, resource_type: &str, view: &RequestView) -> BTreeSet<PatientId> {
        let Some(params) = self.compartment.params_for(resource_type) else {
            return BTreeSet::new();
        };
        let mut found = BTreeSet::new();
        for name in params {
            for raw in view.query_values(name) {
                for part in raw.split(',').filter(|s| !s.is_empty()) {
                    found.insert(reference_value_id(part).to_string());
                }
            }
        }
        found
    }

    /// §4.2 JSON-Patch body: only `add`/`replace` are inspected; `remove`/
    /// `move` on a patient-compartment path fail the request, and any op
    /// touching an unrecognized shape is ignored (it cannot carry a Patient
    /// reference).
    pub fn patients_in_json_patch(&self, resource_type: &str, patch_ops: &[Value]) -> Result<BTreeSet<PatientId>> {
        let restricted_paths: BTreeSet<&str> = self
            .compartment
            .params_for(resource_type)
            .unwrap_or(&[])
            .iter()
            .map(|s| s.as_str())
            .collect();

        let mut found = BTreeSet::new();
        for op in patch_ops {
            let op_name = op
                .get("op")
                .and_then(Value::as_str)
                .ok_or_else(|| ProxyError::InvalidRequest("JSON-Patch operation missing 'op'".into()))?;
            let path = op.get("path").and_then(Value::as_str).unwrap_or("");
            let touches_compartment_field = restricted_paths
                .iter()
                .any(|field| path.trim_start_matches('/') == *field || path.starts_with(&format!("/{field}/")));

            match op_name {
                "remove" | "move" if touches_compartment_field => {
                    return Err(ProxyError::InvalidRequest(format!(
                        "'{op_name}' on patient-compartment path '{path}' is not permitted"
                    )));
                }
                "add" | "replace" => {
                    if let Some(value) = op.get("value")
                        && let Some((type_hint, id)) = crate::fhir_path::parse_reference_value(value)
                        && type_hint.as_deref().is_none_or(|t| t == "Patient")
                    {
                        found.insert(id);
                    }
                }
                _ => {}
            }
        }
        Ok(found)
    }

    /// §4.2 Algorithm — Bundle. `bundle` must be a `Bundle` resource of type
    /// `transaction`.
    pub fn inspect_bundle(&self, bundle: &Value) -> Result<BundlePatients> {
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(ProxyError::InvalidRequest("body is not a Bundle".into()));
        }
        if bundle.get("type").and_then(Value::as_str) != Some("transaction") {
            return Err(ProxyError::InvalidRequest(
                "only transaction Bundles are supported".into(),
            ));
        }
        let entries = bundle
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = BundlePatients {
            updated_patient_ids: Vec::new(),
            creates_new_patient: false,
            referenced_patient_sets: Vec::new(),
        };

        for entry in &entries {
            let request = entry
                .get("request")
                .ok_or_else(|| ProxyError::InvalidRequest("Bundle entry missing 'request'".into()))?;
            let method = request
                .get("method")
                .and_then(Value::as_str)
                .and_then(RequestMethod::parse)
                .ok_or_else(|| ProxyError::InvalidRequest("Bundle entry has unsupported method".into()))?;
            let url = request
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| ProxyError::InvalidRequest("Bundle entry missing 'request.url'".into()))?;
            let resource = entry.get("resource");
            let resource_type = resource
                .and_then(|r| r.get("resourceType"))
                .and_then(Value::as_str)
                .or_else(|| url_resource_type(url));

            match method {
                RequestMethod::Get => {
                    let ids = self.patients_from_entry_url(resource_type, url)?;
                    if ids.is_empty() {
                        return Err(ProxyError::InvalidRequest(
                            "Bundle GET entry carries no resolvable patient reference".into(),
                        ));
                    }
                    result.referenced_patient_sets.push(ids);
                }
                RequestMethod::Post => {
                    let resource = resource.ok_or_else(|| {
                        ProxyError::InvalidRequest("Bundle POST entry missing 'resource'".into())
                    })?;
                    if resource_type == Some("Patient") {
                        result.creates_new_patient = true;
                    } else {
                        let rt = resource_type.ok_or_else(|| {
                            ProxyError::InvalidRequest("Bundle entry resource missing resourceType".into())
                        })?;
                        let ids = self.patients_in_resource(rt, resource);
                        if ids.is_empty() {
                            return Err(ProxyError::InvalidRequest(format!(
                                "Bundle POST entry of type '{rt}' carries no patient reference"
                            )));
                        }
                        result.referenced_patient_sets.push(ids);
                    }
                }
                RequestMethod::Put => {
                    let resource = resource.ok_or_else(|| {
                        ProxyError::InvalidRequest("Bundle PUT entry missing 'resource'".into())
                    })?;
                    if resource_type == Some("Patient") {
                        let id = url_resource_id(url).ok_or_else(|| {
                            ProxyError::InvalidRequest("Bundle PUT Patient entry missing id in url".into())
                        })?;
                        result.updated_patient_ids.push(id);
                    } else {
                        let rt = resource_type.ok_or_else(|| {
                            ProxyError::InvalidRequest("Bundle entry resource missing resourceType".into())
                        })?;
                        let ids = self.patients_in_resource(rt, resource);
                        if ids.is_empty() {
                            return Err(ProxyError::InvalidRequest(format!(
                                "Bundle PUT entry of type '{rt}' carries no patient reference"
                            )));
                        }
                        result.referenced_patient_sets.push(ids);
                    }
                }
                RequestMethod::Patch => {
                    if resource_type != Some("Binary") {
                        return Err(ProxyError::InvalidRequest(
                            "Bundle PATCH entries are only permitted on Binary resources".into(),
                        ));
                    }
                }
                RequestMethod::Delete => {
                    // A deletion's target may or may not be a Patient; nothing to
                    // extract, recorded purely for the caller's audit trail.
                }
            }
        }

        Ok(result)
    }

    fn patients_from_entry_url(&self, resource_type: Option<&str>, url: &str) -> Result<BTreeSet<PatientId>> {
        let (path, query_string) = url.split_once('?').unwrap_or((url, ""));
        if resource_type == Some("Patient")
            && let Some(id) = url_resource_id(path)
        {
            return Ok(BTreeSet::from([id]));
        }
        let Some(rt) = resource_type else {
            return Ok(BTreeSet::new());
        };
        let query = SearchQuery::parse(query_string)?;
        Ok(self.patients_in_search_query(rt, &query))
    }

    /// Variant of [`Self::patients_in_query`] over an already-parsed
    /// [`SearchQuery`] rather than a [`RequestView`] — used for the nested
    /// request URLs embedded in transaction-Bundle GET entries, which the
    /// pipeline never sees as a top-level query string to pre-validate.
    fn patients_in_search_query(&self, resource_type: &str, query: &SearchQuery) -> BTreeSet<PatientId> {
        let Some(params) = self.compartment.params_for(resource_type) else {
            return BTreeSet::new();
        };
        let mut found = BTreeSet::new();
        for name in params {
            for raw in query.union_values(name) {
                found.insert(reference_value_id(&raw).to_string());
            }
        }
        found
    }
}

fn url_resource_type(url: &str) -> Option<&str> {
    url.split('?').next()?.split('/').next()
}

fn url_resource_id(url: &str) -> Option<String> {
    let path = url.split('?').next()?;
    let mut segments = path.split('/');
    let _resource_type = segments.next()?;
    segments.next().map(str::to_string).filter(|s| !s.is_empty())
}
