//! C6 Request Pipeline: the one orchestration point that ties C1/C3/C4/C5/C7
//! together. Grounded on the teacher's per-handler sequencing in
//! `handlers/crud.rs` (auth → check → forward → audit), generalized into a
//! single handler since this proxy has no per-resource-type routes of its
//! own — every FHIR resource type flows through the same pipeline.

use proxy_core::decision::{AccessDecision, DecodedToken, Mutation, PostProcessor};
use proxy_core::error::{ProxyError, Result};
use proxy_core::operation_outcome::OperationOutcome;
use proxy_core::request_view::RequestView;

use crate::allowed_queries::AllowedQueryMatch;
use crate::backend::{resolve_auth_header, BackendResponse};
use crate::metadata;
use crate::post_process;
use crate::AppState;

/// A fully-formed HTTP response, ready for the axum layer to emit. Built
/// either from a successful pipeline run or from a [`ProxyError`] mapped to
/// its status/OperationOutcome pair — `run` never panics and never leaves an
/// error unconverted.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl PipelineResponse {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    fn from_outcome(err: &ProxyError) -> Self {
        let outcome = serde_json::to_value(err.to_operation_outcome()).unwrap_or(serde_json::Value::Null);
        let mut response = Self::json(err.status_code(), &outcome);
        if matches!(err, ProxyError::Auth(_)) {
            response.headers.push(("www-authenticate".to_string(), "Bearer".to_string()));
        }
        response
    }
}

const WELL_KNOWN_SMART_CONFIG: &str = ".well-known/smart-configuration";
const WELL_KNOWN_HEALTH: &str = "health";
const METADATA_PATH: &str = "metadata";

pub async fn run(state: &AppState, mut view: RequestView) -> PipelineResponse {
    let path = view.path.trim_start_matches('/');
    if path == WELL_KNOWN_HEALTH {
        return PipelineResponse::json(200, &metadata::health());
    }
    if path == WELL_KNOWN_SMART_CONFIG {
        return match metadata::smart_configuration(&state.http, &state.config.token_issuer, state.access_checker_kind).await {
            Ok(doc) => PipelineResponse::json(200, &doc),
            Err(err) => {
                tracing::error!(error = %err, "smart-configuration document unavailable");
                PipelineResponse::from_outcome(&err)
            }
        };
    }
    if path == METADATA_PATH {
        return match run_metadata(state, &view).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "metadata proxy failed");
                PipelineResponse::from_outcome(&err)
            }
        };
    }

    match run_authorized(state, &mut view).await {
        Ok(response) => response,
        Err(err) => {
            log_failure(&view, &err);
            PipelineResponse::from_outcome(&err)
        }
    }
}

async fn run_metadata(state: &AppState, view: &RequestView) -> Result<PipelineResponse> {
    let path_and_query = "metadata";
    let auth_header = resolve_auth_header(state.config.backend_type, view.header("authorization"));
    let response = state.backend.forward(view, path_and_query, auth_header).await?;
    let mut capability: serde_json::Value = serde_json::from_slice(&response.body)
        .map_err(|e| ProxyError::Backend(format!("backend /metadata body is not JSON: {e}")))?;
    metadata::inject_security_extension(&mut capability, &state.config.public_base_url)?;
    let body = serde_json::to_vec(&capability)
        .map_err(|e| ProxyError::Backend(format!("failed to re-serialize rewritten CapabilityStatement: {e}")))?;
    finish_response(state, view, response.status, response.headers, body).await
}

/// Steps 2-6 of the pipeline: C3 → C1 → C4 → mutation → C5 → C7.
async fn run_authorized(state: &AppState, view: &mut RequestView) -> Result<PipelineResponse> {
    let allow_match = match &state.allowed_queries {
        Some(checker) => checker.check(view),
        None => AllowedQueryMatch::NotApplicable,
    };

    if allow_match == AllowedQueryMatch::Unauthenticated {
        let response = forward(state, view).await?;
        return finish_response(state, view, response.status, response.headers, response.body).await;
    }

    let token = state.token_verifier.verify(view.header("authorization")).await?;

    let decision = state.access_checker.check(view, &token, &state.inspector, &state.backend).await?;
    let post = match decision {
        AccessDecision::Denied { reason } => return Err(ProxyError::Denied(reason)),
        AccessDecision::Granted { post } => post,
        AccessDecision::GrantedWithMutation { mutation, post } => {
            apply_mutation(view, mutation);
            post
        }
    };

    let response = forward(state, view).await?;
    let response = run_post_processor(state, post, &token, response).await?;
    finish_response(state, view, response.status, response.headers, response.body).await
}

fn apply_mutation(view: &mut RequestView, mutation: Mutation) {
    for name in mutation.remove_query_params {
        view.query_params.retain(|(k, _)| *k != name);
    }
    for (name, value) in mutation.add_query_params {
        match view.query_params.iter_mut().find(|(k, _)| *k == name) {
            Some((_, values)) => values.push(value),
            None => view.query_params.push((name, vec![value])),
        }
    }
    if let Some(path) = mutation.rewrite_path {
        view.path = path;
    }
}

async fn forward(state: &AppState, view: &RequestView) -> Result<BackendResponse> {
    let path_and_query = path_and_query(view);
    let auth_header = resolve_auth_header(state.config.backend_type, view.header("authorization"));
    state.backend.forward(view, &path_and_query, auth_header).await
}

fn path_and_query(view: &RequestView) -> String {
    let path = view.path.trim_start_matches('/');
    if view.query_params.is_empty() {
        return path.to_string();
    }
    let query = view
        .query_params
        .iter()
        .flat_map(|(name, values)| values.iter().map(move |v| (name, v)))
        .map(|(name, value)| format!("{}={}", urlencoding::encode(name), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{path}?{query}")
}

/// Step 6: C7. `PatientListAppend` is fire-and-forget and never replaces the
/// response; `ListEntriesExpand` runs inline and, on success, its batch
/// response *is* the response. A failed expansion is logged and the original
/// List response stands, matching the "post-processor failures never invert
/// a successful upstream response" rule §7 states for the appender.
async fn run_post_processor(
    state: &AppState,
    post: Option<PostProcessor>,
    token: &DecodedToken,
    response: BackendResponse,
) -> Result<BackendResponse> {
    match post {
        None => Ok(response),
        Some(PostProcessor::PatientListAppend) => {
            if let Some(list_id) = token.claim_str("patient_list") {
                post_process::spawn_patient_list_append(state.backend.clone(), list_id.to_string(), &response);
            } else {
                tracing::warn!("patient-list post-processor scheduled but token carries no patient_list claim");
            }
            Ok(response)
        }
        Some(PostProcessor::ListEntriesExpand) => match post_process::expand_list_entries(&state.backend, &response).await {
            Ok(expanded) => Ok(expanded),
            Err(err) => {
                tracing::warn!(error = %err, "list-entries expansion failed, returning the unexpanded List response");
                Ok(response)
            }
        },
    }
}

/// Step 5 rewrite + step 7 gzip. Shared by the normal pipeline and the
/// `/metadata` short-circuit, which also rewrites (structurally) before
/// reaching this point.
async fn finish_response(
    state: &AppState,
    view: &RequestView,
    status: u16,
    upstream_headers: Vec<(String, String)>,
    body: Vec<u8>,
) -> Result<PipelineResponse> {
    let rewritten = crate::backend::rewrite_urls(&body, &state.config.proxy_to, &state.config.public_base_url);

    let wants_gzip = view
        .header("accept-encoding")
        .is_some_and(|v| v.split(',').any(|enc| enc.trim().eq_ignore_ascii_case("gzip")));

    let mut headers = upstream_headers;
    let body = if wants_gzip {
        headers.push(("content-encoding".to_string(), "gzip".to_string()));
        gzip_encode(&rewritten).await?
    } else {
        rewritten
    };

    Ok(PipelineResponse { status, headers, body })
}

async fn gzip_encode(data: &[u8]) -> Result<Vec<u8>> {
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;

    let mut encoder = GzipEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .await
        .map_err(|e| ProxyError::Backend(format!("gzip encode failed: {e}")))?;
    encoder
        .shutdown()
        .await
        .map_err(|e| ProxyError::Backend(format!("gzip encode failed: {e}")))?;
    Ok(encoder.into_inner())
}

fn log_failure(view: &RequestView, err: &ProxyError) {
    match err {
        ProxyError::Auth(_) => tracing::warn!(method = %view.method, path = %view.path, error = %err, "request rejected: auth failure"),
        ProxyError::Denied(_) => tracing::warn!(method = %view.method, path = %view.path, error = %err, "request rejected: access denied"),
        ProxyError::InvalidRequest(_) => tracing::warn!(method = %view.method, path = %view.path, error = %err, "request rejected: invalid request"),
        ProxyError::Backend(_) => tracing::error!(method = %view.method, path = %view.path, error = %err, "backend call failed"),
        ProxyError::Config(_) => unreachable!("ConfigError never reaches the request pipeline"),
    }
}
