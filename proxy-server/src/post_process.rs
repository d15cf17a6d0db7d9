//! Access-Decision Post-Processors (C7, §4.7). The patient-list appender
//! runs as a spawned, fire-and-forget task — its failure must never affect
//! an already-committed success response, mirroring the teacher's
//! `SubscriptionManager::notify`. The list-entries expander runs inline,
//! since its output *is* the response the client sees.

use serde_json::{Value, json};

use proxy_core::error::{ProxyError, Result};
use proxy_core::request_view::{RequestMethod, RequestView};

use crate::backend::{BackendClient, BackendResponse};

/// Spawns the patient-list JSON-Patch append as a background task. Never
/// awaited by the caller — the response has already been written to the
/// client by the time this runs.
pub fn spawn_patient_list_append(backend: BackendClient, list_id: String, response: &BackendResponse) {
    let Some(new_patient_id) = new_patient_id_from_response(response) else {
        tracing::warn!("patient-list appender: could not determine new patient id from upstream response");
        return;
    };

    tokio::spawn(async move {
        if let Err(err) = patch_list_append(&backend, &list_id, &new_patient_id).await {
            tracing::warn!(list_id, new_patient_id, error = %err, "patient-list appender failed");
        }
    });
}

fn new_patient_id_from_response(response: &BackendResponse) -> Option<String> {
    if let Some(location) = &response.location
        && let Some(id) = location.rsplit('/').find(|s| !s.is_empty())
    {
        return Some(id.to_string());
    }
    let body: Value = serde_json::from_slice(&response.body).ok()?;
    if body.get("resourceType").and_then(Value::as_str) == Some("Patient") {
        return body.get("id").and_then(Value::as_str).map(str::to_string);
    }
    None
}

async fn patch_list_append(backend: &BackendClient, list_id: &str, patient_id: &str) -> Result<()> {
    let patch = json!([{
        "op": "add",
        "path": "/entry/-",
        "value": {"item": {"reference": format!("Patient/{patient_id}")}}
    }]);
    let path = format!("List/{list_id}");
    let view = RequestView::new(RequestMethod::Patch, format!("/{path}"), format!("http://backend/{path}"))
        .with_body(serde_json::to_vec(&patch).map_err(|e| ProxyError::Backend(format!("failed to serialize list patch: {e}")))?);
    let response = backend.forward(&view, &path, None).await?;
    if response.status >= 400 {
        return Err(ProxyError::Backend(format!(
            "List/{list_id} patch failed with backend status {}",
            response.status
        )));
    }
    Ok(())
}

/// List-entries expansion (§4.7). The upstream response is a `List`
/// resource; every `entry.item` reference of the form `Group/{gid}` is
/// re-fetched as a transaction batch Bundle, and the batch response replaces
/// the `List` body the client sees. Order of entries is preserved. Entries
/// referencing anything other than a `Group` are left alone.
pub async fn expand_list_entries(backend: &BackendClient, list_response: &BackendResponse) -> Result<BackendResponse> {
    let list: Value = serde_json::from_slice(&list_response.body)
        .map_err(|e| ProxyError::Backend(format!("list-entries expansion: response body is not JSON: {e}")))?;

    let references: Vec<String> = list
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("item"))
        .filter_map(|item| item.get("reference"))
        .filter_map(Value::as_str)
        .filter(|reference| reference.starts_with("Group/"))
        .map(str::to_string)
        .collect();

    let batch_entries: Vec<Value> = references
        .iter()
        .map(|reference| {
            json!({
                "request": {"method": "GET", "url": reference}
            })
        })
        .collect();

    let batch = json!({
        "resourceType": "Bundle",
        "type": "batch",
        "entry": batch_entries
    });

    let view = RequestView::new(RequestMethod::Post, "/", "http://backend/")
        .with_body(serde_json::to_vec(&batch).map_err(|e| ProxyError::Backend(format!("failed to serialize batch bundle: {e}")))?);
    backend.forward(&view, "", None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_patient_id_from_location_header() {
        let response = BackendResponse {
            status: 201,
            headers: vec![],
            body: b"{}".to_vec(),
            location: Some("Patient/p42".to_string()),
        };
        assert_eq!(new_patient_id_from_response(&response), Some("p42".to_string()));
    }

    #[test]
    fn new_patient_id_from_body_when_no_location() {
        let response = BackendResponse {
            status: 200,
            headers: vec![],
            body: br#"{"resourceType":"Patient","id":"p9"}"#.to_vec(),
            location: None,
        };
        assert_eq!(new_patient_id_from_response(&response), Some("p9".to_string()));
    }

    #[test]
    fn no_id_available_returns_none() {
        let response = BackendResponse {
            status: 200,
            headers: vec![],
            body: b"{}".to_vec(),
            location: None,
        };
        assert_eq!(new_patient_id_from_response(&response), None);
    }

    #[tokio::test]
    async fn expand_list_entries_requires_json_body() {
        let backend = BackendClient::new(reqwest::Client::new(), "http://backend".to_string(), crate::config::BackendType::Generic);
        let response = BackendResponse {
            status: 200,
            headers: vec![],
            body: b"not json".to_vec(),
            location: None,
        };
        assert!(expand_list_entries(&backend, &response).await.is_err());
    }

    #[test]
    fn list_entries_filter_keeps_only_group_references() {
        let list = json!({
            "resourceType": "List",
            "entry": [
                {"item": {"reference": "Group/g1"}},
                {"item": {"reference": "Patient/p1"}},
                {"item": {"reference": "Group/g2"}},
            ]
        });
        let references: Vec<String> = list["entry"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|entry| entry.get("item"))
            .filter_map(|item| item.get("reference"))
            .filter_map(Value::as_str)
            .filter(|reference| reference.starts_with("Group/"))
            .map(str::to_string)
            .collect();
        assert_eq!(references, vec!["Group/g1".to_string(), "Group/g2".to_string()]);
    }
}
