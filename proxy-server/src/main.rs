//! FHIR R4 Authorizing Reverse Proxy — entry point

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxy_core::compartment::CompartmentMap;
use proxy_core::fhir_path::PatientFhirPathMap;
use proxy_core::inspector::ResourceInspector;

use proxy_server::access::{
    AccessChecker, AccessListChecker, PatientCompartmentChecker, PermissiveChecker, RolePermissionChecker, SyncStrategyChecker,
};
use proxy_server::allowed_queries::AllowedQueriesChecker;
use proxy_server::auth::TokenVerifier;
use proxy_server::backend::BackendClient;
use proxy_server::config::{AccessCheckerKind, ProxyConfig};
use proxy_server::{build_router, tls, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting FHIR authorizing reverse proxy...");

    let config = ProxyConfig::from_env().unwrap_or_else(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        std::process::exit(1);
    });

    let compartment = CompartmentMap::from_embedded().unwrap_or_else(|e| {
        tracing::error!("Failed to load embedded compartment definition: {}", e);
        std::process::exit(1);
    });
    let fhir_paths = PatientFhirPathMap::from_embedded().unwrap_or_else(|e| {
        tracing::error!("Failed to load embedded fhir-path table: {}", e);
        std::process::exit(1);
    });
    let inspector = ResourceInspector::new(compartment, fhir_paths);

    let http = reqwest::Client::builder()
        .timeout(config.backend_timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        });

    let backend = BackendClient::new(http.clone(), config.proxy_to.clone(), config.backend_type);

    let access_checker = match config.access_checker {
        AccessCheckerKind::PatientCompartment => AccessChecker::PatientCompartment(PatientCompartmentChecker::new()),
        AccessCheckerKind::AccessList => AccessChecker::AccessList(AccessListChecker::new()),
        AccessCheckerKind::Permission => AccessChecker::RolePermission(RolePermissionChecker::new()),
        AccessCheckerKind::SyncStrategy => AccessChecker::SyncStrategy(SyncStrategyChecker::new()),
        AccessCheckerKind::Permissive => AccessChecker::Permissive(PermissiveChecker::new()),
    };

    let allowed_queries = match &config.allowed_queries_config {
        Some(path) => Some(AllowedQueriesChecker::load(path).unwrap_or_else(|e| {
            tracing::error!("Failed to load ALLOWED_QUERIES_CONFIG: {}", e);
            std::process::exit(1);
        })),
        None => None,
    };

    let token_verifier = TokenVerifier::new(config.token_issuer.clone(), http.clone());

    tracing::info!(access_checker = ?config.access_checker, backend_type = ?config.backend_type, "configuration loaded");

    let bind_addr = config.bind_addr;
    let tls_files = config.tls.clone();
    let access_checker_kind = config.access_checker;

    let state = Arc::new(AppState {
        config,
        http,
        token_verifier,
        access_checker,
        access_checker_kind,
        backend,
        allowed_queries,
        inspector,
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap_or_else(|e| {
        tracing::error!("Failed to bind to {}: {}", bind_addr, e);
        std::process::exit(1);
    });

    if let Some(tls_files) = tls_files {
        let acceptor = tls::load_tls_acceptor(
            tls_files.cert_path.to_string_lossy().as_ref(),
            tls_files.key_path.to_string_lossy().as_ref(),
        )
        .unwrap_or_else(|e| {
            tracing::error!("Failed to load TLS config: {}", e);
            std::process::exit(1);
        });

        tracing::info!("Listening on https://{}", bind_addr);
        let tls_listener = tls::TlsListener::new(listener, acceptor);
        axum::serve(tls_listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .unwrap_or_else(|e| tracing::error!("Server error: {}", e));
    } else {
        tracing::info!("Listening on http://{}", bind_addr);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .unwrap_or_else(|e| tracing::error!("Server error: {}", e));
    }

    tracing::info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
