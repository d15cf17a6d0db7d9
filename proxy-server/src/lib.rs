//! FHIR R4 Authorizing Reverse Proxy
//!
//! Sits between untrusted clients and a trusted FHIR backend: verifies a
//! bearer token, consults a pluggable access-checker, forwards the request,
//! rewrites the response, and runs access-driven post-processing. See the
//! individual modules for each component (C1-C9) this implements.

pub mod access;
pub mod allowed_queries;
pub mod auth;
pub mod backend;
pub mod config;
pub mod metadata;
pub mod pipeline;
pub mod post_process;
pub mod tls;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use proxy_core::error::{ProxyError, Result};
use proxy_core::inspector::ResourceInspector;
use proxy_core::request_view::{RequestMethod, RequestView};
use proxy_core::search_query::SearchQuery;

use access::AccessChecker;
use allowed_queries::AllowedQueriesChecker;
use auth::TokenVerifier;
use backend::BackendClient;
use config::{AccessCheckerKind, ProxyConfig};

/// A request body larger than this is rejected before it ever reaches the
/// pipeline — mirrors the teacher's own `RequestBodyLimitLayer` ceiling.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Everything the pipeline needs, built once at startup and shared behind an
/// `Arc` — the same "singleton, no per-request rebuild" treatment the
/// teacher gives its own `AppState`.
pub struct AppState {
    pub config: ProxyConfig,
    pub http: reqwest::Client,
    pub token_verifier: TokenVerifier,
    pub access_checker: AccessChecker,
    pub access_checker_kind: AccessCheckerKind,
    pub backend: BackendClient,
    pub allowed_queries: Option<AllowedQueriesChecker>,
    pub inspector: ResourceInspector,
}

/// Build the application router: one catch-all handler runs every request
/// through [`pipeline::run`] — there are no per-resource-type routes, since
/// C6 already dispatches on method/resource-type internally.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .fallback(any(handle))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match build_request_view(req).await {
        Ok(view) => into_axum_response(pipeline::run(&state, view).await),
        Err(err) => into_axum_response(pipeline::PipelineResponse {
            status: err.status_code(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(&err.to_operation_outcome()).unwrap_or_default(),
        }),
    }
}

fn into_axum_response(response: pipeline::PipelineResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response())
}

/// Projects an axum [`Request`] into a [`RequestView`], materializing the
/// body exactly once and validating/rejecting dangerous query modifiers up
/// front so every downstream collaborator can trust `query_params` without
/// re-parsing.
async fn build_request_view(req: Request) -> Result<RequestView> {
    let method = RequestMethod::parse(req.method().as_str())
        .ok_or_else(|| ProxyError::InvalidRequest(format!("unsupported HTTP method '{}'", req.method())))?;
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let url = uri.to_string();
    let headers = flatten_headers(req.headers());

    let search_query = SearchQuery::parse(uri.query().unwrap_or(""))?;
    let query_params = search_query
        .param_names()
        .map(|name| (name.to_string(), search_query.values(name).to_vec()))
        .collect();

    let (resource_type, resource_id) = resource_type_and_id(&path);

    let body = to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;

    let mut view = RequestView::new(method, path, url);
    view.resource_type = resource_type;
    view.resource_id = resource_id;
    view.query_params = query_params;
    view.headers = headers;
    Ok(if body.is_empty() { view } else { view.with_body(body.to_vec()) })
}

fn flatten_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

/// `/` (Bundle POST) and the well-known/metadata routes carry no resource
/// type. Everything else is `/{resourceType}` or `/{resourceType}/{id}` —
/// this proxy has no nested-path operations of its own (`_history`,
/// `$everything`, etc. simply forward with `resource_id` set to the segment
/// immediately following the resource type, which is what every access
/// checker needs).
fn resource_type_and_id(path: &str) -> (Option<String>, Option<String>) {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return (None, None);
    }
    let mut segments = trimmed.split('/').filter(|s| !s.is_empty());
    let resource_type = segments.next().map(str::to_string);
    let resource_id = segments.next().map(str::to_string);
    (resource_type, resource_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_and_id_from_collection_path() {
        assert_eq!(resource_type_and_id("/Patient"), (Some("Patient".to_string()), None));
    }

    #[test]
    fn resource_type_and_id_from_instance_path() {
        assert_eq!(
            resource_type_and_id("/Patient/p1"),
            (Some("Patient".to_string()), Some("p1".to_string()))
        );
    }

    #[test]
    fn root_path_has_no_resource_type() {
        assert_eq!(resource_type_and_id("/"), (None, None));
        assert_eq!(resource_type_and_id(""), (None, None));
    }
}
