use std::collections::HashMap;

/// A set of changes C4 asks the pipeline to apply to the outbound request
/// before it is forwarded to the backend. The body is never rewritten — only
/// query parameters and, optionally, the path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    /// Query parameters to add. Multiple values under the same name (e.g.
    /// repeated `_tag=`) are represented as repeated entries in this vec.
    pub add_query_params: Vec<(String, String)>,
    /// Query parameter names to strip entirely before forwarding.
    pub remove_query_params: Vec<String>,
    /// Replacement path, if the checker needs to redirect the request
    /// (e.g. rewriting a search into a more specific sub-resource path).
    pub rewrite_path: Option<String>,
}

impl Mutation {
    pub fn is_empty(&self) -> bool {
        self.add_query_params.is_empty()
            && self.remove_query_params.is_empty()
            && self.rewrite_path.is_none()
    }

    pub fn add_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_query_params.push((name.into(), value.into()));
        self
    }
}

/// A side effect that runs after the backend responds. `None` variants never
/// appear on the wire; this is an in-process callback identifier resolved by
/// the server crate (the core crate only names *which* post-processor runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessor {
    /// Append a newly created/updated Patient id to the access-list checker's List.
    PatientListAppend,
    /// Expand a List response's Group references into a batch Bundle fetch.
    ListEntriesExpand,
}

/// The outcome of an access-checker's `check()` call (C4's contract).
///
/// `Denied` must never be overturned by a later stage: once produced, the
/// pipeline stops and no bytes reach the backend for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Granted {
        post: Option<PostProcessor>,
    },
    Denied {
        reason: String,
    },
    GrantedWithMutation {
        mutation: Mutation,
        post: Option<PostProcessor>,
    },
}

impl AccessDecision {
    pub fn granted() -> Self {
        AccessDecision::Granted { post: None }
    }

    pub fn granted_with_post(post: PostProcessor) -> Self {
        AccessDecision::Granted { post: Some(post) }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        AccessDecision::Denied {
            reason: reason.into(),
        }
    }

    pub fn granted_with_mutation(mutation: Mutation) -> Self {
        AccessDecision::GrantedWithMutation {
            mutation,
            post: None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, AccessDecision::Denied { .. })
    }
}

/// Claims extracted from a verified JWT (§3 DecodedToken). Signature and
/// issuer have already been checked before this is constructed; downstream
/// code may trust every field.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub issuer: String,
    pub subject: String,
    pub expiry: Option<i64>,
    pub claims: HashMap<String, serde_json::Value>,
}

impl DecodedToken {
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(|v| v.as_str())
    }

    pub fn claim_str_list(&self, name: &str) -> Vec<String> {
        match self.claims.get(name) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(serde_json::Value::String(s)) => {
                s.split_whitespace().map(str::to_string).collect()
            }
            _ => Vec::new(),
        }
    }

    /// `realm_access.roles` is nested one level deep; named explicitly since
    /// it's the one claim in §4.4.4 that isn't a top-level field.
    pub fn realm_roles(&self) -> Vec<String> {
        self.claims
            .get("realm_access")
            .and_then(|v| v.get("roles"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
