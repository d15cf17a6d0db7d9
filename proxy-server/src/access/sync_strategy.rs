//! Sync-strategy mutation checker (§4.4.5). Resolves the caller's assigned
//! data partitions (CareTeam, Organization, or Location ids) from the
//! backend's own configuration Composition/Binary pair, then emits `_tag`
//! query-parameter mutations scoping every outbound request to those
//! partitions. Partition ids are cached per token subject behind a
//! TTL'd `RwLock`, the same double-checked-locking shape as the token
//! verifier's JWKS cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::Value;
use tokio::sync::RwLock;

use proxy_core::decision::{AccessDecision, DecodedToken, Mutation, PostProcessor};
use proxy_core::error::{ProxyError, Result};
use proxy_core::inspector::ResourceInspector;
use proxy_core::request_view::{RequestMethod, RequestView};

use crate::backend::BackendClient;

const PARTITION_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Resource types that never get a `_tag` mutation — application-config
/// resources shared across every partition.
const IGNORED_RESOURCE_TYPES: &[&str] = &["Questionnaire", "StructureMap"];

/// `StructureMap` ids that are shared config even though the resource type
/// isn't globally ignored (matched against a request's `_id` parameter).
const IGNORED_STRUCTURE_MAP_IDS: &[&str] = &["bootstrap", "config"];

const TAG_URL_CARE_TEAM: &str = "https://smartregister.org/care-team-tag-id";
const TAG_URL_ORGANIZATION: &str = "https://smartregister.org/organisation-tag-id";
const TAG_URL_LOCATION: &str = "https://smartregister.org/location-tag-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStrategyType {
    CareTeam,
    Organization,
    Location,
}

impl SyncStrategyType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "CareTeam" => Some(Self::CareTeam),
            "Organization" => Some(Self::Organization),
            "Location" => Some(Self::Location),
            _ => None,
        }
    }

    fn tag_url(self) -> &'static str {
        match self {
            Self::CareTeam => TAG_URL_CARE_TEAM,
            Self::Organization => TAG_URL_ORGANIZATION,
            Self::Location => TAG_URL_LOCATION,
        }
    }

    fn resource_type(self) -> &'static str {
        match self {
            Self::CareTeam => "CareTeam",
            Self::Organization => "Organization",
            Self::Location => "Location",
        }
    }
}

#[derive(Debug, Clone)]
struct PartitionInfo {
    tag_url: &'static str,
    ids: Vec<String>,
}

#[derive(Debug, Default)]
struct PartitionCache {
    entries: HashMap<String, (PartitionInfo, Instant)>,
}

#[derive(Clone)]
pub struct SyncStrategyChecker {
    cache: Arc<RwLock<PartitionCache>>,
}

impl SyncStrategyChecker {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(RwLock::new(PartitionCache::default())),
        }
    }

    pub async fn check(
        &self,
        view: &RequestView,
        token: &DecodedToken,
        _inspector: &ResourceInspector,
        backend: &BackendClient,
    ) -> Result<AccessDecision> {
        let app_id = token
            .claim_str("fhir_core_app_id")
            .ok_or_else(|| ProxyError::Denied("token carries no fhir_core_app_id claim".into()))?;

        let post = list_entries_post_processor(view);

        let Some(resource_type) = view.resource_type.as_deref() else {
            // Sync-strategy tagging applies to single-resource-type requests;
            // Bundle transactions pass through untagged.
            return Ok(decision_for(Mutation::default(), post));
        };

        if is_ignored(resource_type, view) {
            return Ok(decision_for(Mutation::default(), post));
        }

        let partition = self.partition_ids(app_id, token.subject.as_str(), backend).await?;
        if partition.ids.is_empty() {
            return Err(ProxyError::Backend(
                "configured syncStrategy resolved to an empty partition id list".into(),
            ));
        }

        let mut mutation = Mutation::default();
        for id in &partition.ids {
            mutation = mutation.add_param("_tag", format!("{}|{}", partition.tag_url, id));
        }
        Ok(decision_for(mutation, post))
    }

    async fn partition_ids(&self, app_id: &str, subject: &str, backend: &BackendClient) -> Result<PartitionInfo> {
        let cache_key = format!("{app_id}:{subject}");
        if let Some(info) = self.cached(&cache_key).await {
            return Ok(info);
        }

        let mut cache = self.cache.write().await;
        if let Some((info, fetched_at)) = cache.entries.get(&cache_key)
            && fetched_at.elapsed() <= PARTITION_CACHE_TTL
        {
            return Ok(info.clone());
        }

        let strategy_type = self.resolve_sync_strategy_type(app_id, backend).await?;
        let ids = self.resolve_partition_member_ids(subject, strategy_type, backend).await?;
        let info = PartitionInfo {
            tag_url: strategy_type.tag_url(),
            ids,
        };
        cache.entries.insert(cache_key, (info.clone(), Instant::now()));
        Ok(info)
    }

    async fn cached(&self, cache_key: &str) -> Option<PartitionInfo> {
        let cache = self.cache.read().await;
        cache
            .entries
            .get(cache_key)
            .filter(|(_, fetched_at)| fetched_at.elapsed() <= PARTITION_CACHE_TTL)
            .map(|(info, _)| info.clone())
    }

    /// §4.4.5 step 1–2: `Composition?identifier={appId}` → locate the
    /// section with `focus.identifier.value == "application"` → dereference
    /// to a `Binary`, base64-decode its `data`, and read `syncStrategy`.
    async fn resolve_sync_strategy_type(&self, app_id: &str, backend: &BackendClient) -> Result<SyncStrategyType> {
        let search = RequestView::new(RequestMethod::Get, "/Composition", "http://backend/Composition");
        let path_and_query = format!("Composition?identifier={app_id}");
        let response = backend.forward(&search, &path_and_query, None).await?;
        let bundle: Value = serde_json::from_slice(&response.body)
            .map_err(|e| ProxyError::Backend(format!("Composition search returned non-JSON body: {e}")))?;

        let composition = bundle
            .get("entry")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .and_then(|entry| entry.get("resource"))
            .ok_or_else(|| ProxyError::Backend(format!("no Composition found for fhir_core_app_id '{app_id}'")))?;

        let sections = composition.get("section").and_then(Value::as_array).cloned().unwrap_or_default();
        let binary_ref = sections
            .iter()
            .find(|section| {
                section
                    .get("focus")
                    .and_then(|f| f.get("identifier"))
                    .and_then(|i| i.get("value"))
                    .and_then(Value::as_str)
                    == Some("application")
            })
            .and_then(|section| section.get("focus"))
            .and_then(|f| f.get("reference"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Backend("Composition has no 'application' focus section".into()))?;

        let binary_path = binary_ref.trim_start_matches('/');
        let binary_request = RequestView::new(RequestMethod::Get, format!("/{binary_path}"), format!("http://backend/{binary_path}"));
        let binary_response = backend.forward(&binary_request, binary_path, None).await?;
        let binary: Value = serde_json::from_slice(&binary_response.body)
            .map_err(|e| ProxyError::Backend(format!("Binary fetch returned non-JSON body: {e}")))?;

        let data_b64 = binary
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Backend("application config Binary has no 'data' field".into()))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .map_err(|e| ProxyError::Backend(format!("application config Binary data is not valid base64: {e}")))?;
        let config: Value = serde_json::from_slice(&decoded)
            .map_err(|e| ProxyError::Backend(format!("application config Binary data is not valid JSON: {e}")))?;

        let strategy = config
            .get("syncStrategy")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::Backend("application config has no 'syncStrategy' field".into()))?;
        SyncStrategyType::parse(strategy)
            .ok_or_else(|| ProxyError::Backend(format!("unsupported syncStrategy value '{strategy}'")))
    }

    /// §4.4.5 step 3: resolve the caller's own partition memberships via
    /// `PractitionerRole`, never falling back to a hard-coded identity.
    async fn resolve_partition_member_ids(&self, subject: &str, strategy_type: SyncStrategyType, backend: &BackendClient) -> Result<Vec<String>> {
        let path_and_query = format!("PractitionerRole?practitioner={subject}&_elements=organization,location,careTeam");
        let search = RequestView::new(RequestMethod::Get, "/PractitionerRole", "http://backend/PractitionerRole");
        let response = backend.forward(&search, &path_and_query, None).await?;
        let bundle: Value = serde_json::from_slice(&response.body)
            .map_err(|e| ProxyError::Backend(format!("PractitionerRole search returned non-JSON body: {e}")))?;

        let field = match strategy_type {
            SyncStrategyType::CareTeam => "careTeam",
            SyncStrategyType::Organization => "organization",
            SyncStrategyType::Location => "location",
        };

        let mut ids = Vec::new();
        for entry in bundle.get("entry").and_then(Value::as_array).into_iter().flatten() {
            let Some(resource) = entry.get("resource") else { continue };
            let refs = resource.get(field).and_then(Value::as_array).cloned().unwrap_or_default();
            for r in refs {
                if let Some(reference) = r.get("reference").and_then(Value::as_str)
                    && let Some(id) = reference.rsplit('/').next()
                {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl Default for SyncStrategyChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ignored(resource_type: &str, view: &RequestView) -> bool {
    if IGNORED_RESOURCE_TYPES.contains(&resource_type) {
        return true;
    }
    if resource_type == "StructureMap"
        && let Some(id) = view.single_query_value("_id")
        && IGNORED_STRUCTURE_MAP_IDS.contains(&id)
    {
        return true;
    }
    false
}

fn list_entries_post_processor(view: &RequestView) -> Option<PostProcessor> {
    (view.header("fhir-gateway-mode") == Some("list-entries")).then_some(PostProcessor::ListEntriesExpand)
}

fn decision_for(mutation: Mutation, post: Option<PostProcessor>) -> AccessDecision {
    if mutation.is_empty() && post.is_none() {
        return AccessDecision::granted();
    }
    if mutation.is_empty() {
        return AccessDecision::Granted { post };
    }
    AccessDecision::GrantedWithMutation { mutation, post }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_resource_type_never_tagged() {
        let view = RequestView::new(RequestMethod::Get, "/Questionnaire", "http://x/Questionnaire");
        assert!(is_ignored("Questionnaire", &view));
    }

    #[test]
    fn ignored_structure_map_by_id() {
        let mut view = RequestView::new(RequestMethod::Get, "/StructureMap", "http://x/StructureMap");
        view.query_params.push(("_id".to_string(), vec!["bootstrap".to_string()]));
        assert!(is_ignored("StructureMap", &view));
    }

    #[test]
    fn non_ignored_structure_map_by_id_is_not_exempt() {
        let mut view = RequestView::new(RequestMethod::Get, "/StructureMap", "http://x/StructureMap");
        view.query_params.push(("_id".to_string(), vec!["custom".to_string()]));
        assert!(!is_ignored("StructureMap", &view));
    }

    #[test]
    fn list_entries_header_yields_post_processor() {
        let mut view = RequestView::new(RequestMethod::Get, "/List/1", "http://x/List/1");
        view.headers.push(("FHIR-Gateway-Mode".to_string(), "list-entries".to_string()));
        assert_eq!(list_entries_post_processor(&view), Some(PostProcessor::ListEntriesExpand));
    }

    #[test]
    fn sync_strategy_type_maps_known_values() {
        assert_eq!(SyncStrategyType::parse("Location"), Some(SyncStrategyType::Location));
        assert_eq!(SyncStrategyType::parse("Unknown"), None);
    }

    #[test]
    fn decision_for_plain_grant_when_nothing_to_apply() {
        assert_eq!(decision_for(Mutation::default(), None), AccessDecision::granted());
    }
}
