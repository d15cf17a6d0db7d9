//! Allowed-Queries checker (C3, §4.3). A declarative JSON allow-list, loaded
//! once at startup; a malformed config is a `ConfigError` and refuses to
//! start the process, the same "load or exit" discipline the teacher's
//! `config.rs` applies to its own YAML file.

use std::path::Path;

use serde::Deserialize;

use proxy_core::error::{ProxyError, Result};
use proxy_core::request_view::{RequestMethod, RequestView};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllowedQueryEntry {
    path: String,
    #[serde(default)]
    methods: Option<Vec<String>>,
    #[serde(default)]
    required_params: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    forbidden_params: Option<Vec<String>>,
    #[serde(default)]
    unauthenticated: bool,
}

/// Outcome of matching a request against the allow-list: either it isn't
/// covered at all (C4 still runs) or it matched, with or without requiring
/// a bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedQueryMatch {
    NotApplicable,
    RequiresAuth,
    Unauthenticated,
}

#[derive(Debug, Clone)]
pub struct AllowedQueriesChecker {
    entries: Vec<AllowedQueryEntry>,
}

impl AllowedQueriesChecker {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("failed to read ALLOWED_QUERIES_CONFIG '{}': {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let entries: Vec<AllowedQueryEntry> =
            serde_json::from_str(raw).map_err(|e| ProxyError::Config(format!("malformed allowed-queries JSON: {e}")))?;
        for entry in &entries {
            if entry.path.trim().is_empty() {
                return Err(ProxyError::Config("allowed-queries entry has an empty 'path'".into()));
            }
        }
        Ok(Self { entries })
    }

    pub fn check(&self, view: &RequestView) -> AllowedQueryMatch {
        for entry in &self.entries {
            if entry_matches(entry, view) {
                return if entry.unauthenticated {
                    AllowedQueryMatch::Unauthenticated
                } else {
                    AllowedQueryMatch::RequiresAuth
                };
            }
        }
        AllowedQueryMatch::NotApplicable
    }
}

fn entry_matches(entry: &AllowedQueryEntry, view: &RequestView) -> bool {
    if !path_matches(&entry.path, &view.path) {
        return false;
    }
    if let Some(methods) = &entry.methods
        && !methods.iter().any(|m| m.eq_ignore_ascii_case(view.method.as_str()))
    {
        return false;
    }
    if let Some(required) = &entry.required_params {
        for (name, expected) in required {
            let values = view.query_values(name);
            if values.is_empty() {
                return false;
            }
            if expected != "*" && !values.iter().any(|v| v == expected) {
                return false;
            }
        }
    }
    if let Some(forbidden) = &entry.forbidden_params
        && forbidden.iter().any(|name| !view.query_values(name).is_empty())
    {
        return false;
    }
    true
}

/// Exact match, or a trailing-`*` glob (`Composition/*` matches any path
/// sharing that prefix, including the bare prefix itself).
fn path_matches(pattern: &str, path: &str) -> bool {
    let path = path.trim_start_matches('/');
    let pattern = pattern.trim_start_matches('/');
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == pattern,
    }
}
