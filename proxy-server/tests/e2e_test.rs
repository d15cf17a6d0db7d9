//! Pipeline-level integration tests: build the real `Router` via
//! `build_router` and drive it with `tower::ServiceExt::oneshot`, the way the
//! teacher's own end-to-end suite exercises its handlers. A second in-process
//! axum server stands in for the FHIR backend so these tests need neither a
//! real backend nor a real IdP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceExt;

use proxy_core::compartment::CompartmentMap;
use proxy_core::fhir_path::PatientFhirPathMap;
use proxy_core::inspector::ResourceInspector;

use proxy_server::access::{AccessChecker, AccessListChecker};
use proxy_server::allowed_queries::AllowedQueriesChecker;
use proxy_server::auth::TokenVerifier;
use proxy_server::backend::BackendClient;
use proxy_server::config::{AccessCheckerKind, BackendType, ProxyConfig, RunMode};
use proxy_server::{build_router, AppState};

/// Starts a throwaway axum server that always answers `GET /Patient` with a
/// two-entry Bundle, bound to an ephemeral port so tests can run concurrently
/// without colliding.
async fn spawn_mock_backend() -> String {
    let app = Router::new().route(
        "/Patient",
        get(|| async {
            Json(serde_json::json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "entry": [
                    {"resource": {"resourceType": "Patient", "id": "p1"}},
                    {"resource": {"resourceType": "Patient", "id": "p2"}},
                ]
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    format!("http://{addr}")
}

fn test_config(proxy_to: String, allowed_queries_config: Option<PathBuf>) -> ProxyConfig {
    ProxyConfig {
        proxy_to,
        token_issuer: "https://issuer.example.com".to_string(),
        access_checker: AccessCheckerKind::AccessList,
        backend_type: BackendType::Generic,
        run_mode: RunMode::Production,
        allowed_queries_config,
        bind_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        backend_timeout: Duration::from_secs(5),
        public_base_url: "https://proxy.example.com".to_string(),
        tls: None,
    }
}

async fn build_state(config: ProxyConfig, allowed_queries: Option<AllowedQueriesChecker>) -> Arc<AppState> {
    let compartment = CompartmentMap::from_embedded().unwrap();
    let fhir_paths = PatientFhirPathMap::from_embedded().unwrap();
    let inspector = ResourceInspector::new(compartment, fhir_paths);
    let http = reqwest::Client::new();
    let backend = BackendClient::new(http.clone(), config.proxy_to.clone(), config.backend_type);
    let token_verifier = TokenVerifier::new(config.token_issuer.clone(), http.clone());

    Arc::new(AppState {
        config,
        http,
        token_verifier,
        access_checker: AccessChecker::AccessList(AccessListChecker::new()),
        access_checker_kind: AccessCheckerKind::AccessList,
        backend,
        allowed_queries,
        inspector,
    })
}

#[tokio::test]
async fn health_endpoint_requires_no_auth_and_no_backend() {
    let config = test_config("http://127.0.0.1:1".to_string(), None);
    let state = build_state(config, None).await;
    let app = build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn request_without_bearer_token_is_rejected_with_401() {
    let backend_url = spawn_mock_backend().await;
    let config = test_config(backend_url, None);
    let state = build_state(config, None).await;
    let app = build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/Patient").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("www-authenticate").is_some());
}

#[tokio::test]
async fn allow_listed_unauthenticated_path_forwards_and_rewrites_backend_url() {
    let backend_url = spawn_mock_backend().await;
    let allowed_queries = AllowedQueriesChecker::from_json_str(
        r#"[{"path": "Patient", "methods": ["GET"], "unauthenticated": true}]"#,
    )
    .unwrap();
    let config = test_config(backend_url.clone(), None);
    let state = build_state(config, Some(allowed_queries)).await;
    let app = build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/Patient").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(!text.contains(&backend_url), "backend URL should have been rewritten out of the body");
    assert!(text.contains("Bundle"));
}

#[tokio::test]
async fn root_path_with_no_resource_type_still_requires_auth() {
    let config = test_config("http://127.0.0.1:1".to_string(), None);
    let state = build_state(config, None).await;
    let app = build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/").method("POST").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn dangerous_search_modifier_is_rejected_before_reaching_auth() {
    let config = test_config("http://127.0.0.1:1".to_string(), None);
    let state = build_state(config, None).await;
    let app = build_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/Patient?_include=Patient:organization")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
