use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use proxy_core::error::{ProxyError, Result};

/// Which C4 access-checker variant is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheckerKind {
    AccessList,
    PatientCompartment,
    Permission,
    SyncStrategy,
    /// Permissive dev-mode checker; only selectable under `RUN_MODE=DEV`.
    Permissive,
}

impl AccessCheckerKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Self::AccessList),
            "patient" => Some(Self::PatientCompartment),
            "permission" => Some(Self::Permission),
            "data" => Some(Self::SyncStrategy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Gcp,
    Generic,
}

impl BackendType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "GCP" => Some(Self::Gcp),
            "GENERIC" => Some(Self::Generic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Dev,
    Production,
}


/// The parsed form of the environment-variable surface (§6). Built once at
/// startup by [`ProxyConfig::from_env`], then held behind an `Arc` and never
/// mutated.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub proxy_to: String,
    pub token_issuer: String,
    pub access_checker: AccessCheckerKind,
    pub backend_type: BackendType,
    pub run_mode: RunMode,
    pub allowed_queries_config: Option<PathBuf>,
    pub bind_addr: SocketAddr,
    pub backend_timeout: Duration,
    pub public_base_url: String,
    /// TLS termination is out of scope to specify, but the listener option is
    /// cheap to keep (the teacher carries the same knob); `Some` only when
    /// both `PROXY_TLS_CERT`/`PROXY_TLS_KEY` are set.
    pub tls: Option<TlsFiles>,
}

#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let proxy_to = require_env("PROXY_TO")?;
        let token_issuer = require_env("TOKEN_ISSUER")?;

        let run_mode = match std::env::var("RUN_MODE").ok().as_deref() {
            Some("DEV") => RunMode::Dev,
            _ => RunMode::Production,
        };

        let access_checker = match std::env::var("ACCESS_CHECKER").ok() {
            Some(raw) => AccessCheckerKind::parse(&raw).ok_or_else(|| {
                ProxyError::Config(format!("ACCESS_CHECKER has unknown value '{raw}'"))
            })?,
            None if run_mode == RunMode::Dev => AccessCheckerKind::Permissive,
            None => {
                return Err(ProxyError::Config(
                    "ACCESS_CHECKER is required unless RUN_MODE=DEV".into(),
                ));
            }
        };

        let backend_type = {
            let raw = require_env("BACKEND_TYPE")?;
            BackendType::parse(&raw)
                .ok_or_else(|| ProxyError::Config(format!("BACKEND_TYPE has unknown value '{raw}'")))?
        };

        let allowed_queries_config = std::env::var("ALLOWED_QUERIES_CONFIG")
            .ok()
            .map(PathBuf::from);

        let bind_addr: SocketAddr = std::env::var("PROXY_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid PROXY_BIND_ADDR: {e}")))?;

        let backend_timeout_secs: u64 = std::env::var("PROXY_BACKEND_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let public_base_url = std::env::var("PROXY_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://{bind_addr}"));

        let tls = match (std::env::var("PROXY_TLS_CERT").ok(), std::env::var("PROXY_TLS_KEY").ok()) {
            (Some(cert_path), Some(key_path)) => Some(TlsFiles {
                cert_path: PathBuf::from(cert_path),
                key_path: PathBuf::from(key_path),
            }),
            (None, None) => None,
            _ => {
                return Err(ProxyError::Config(
                    "PROXY_TLS_CERT and PROXY_TLS_KEY must both be set or both be absent".into(),
                ));
            }
        };

        Ok(Self {
            proxy_to,
            token_issuer,
            access_checker,
            backend_type,
            run_mode,
            allowed_queries_config,
            bind_addr,
            backend_timeout: Duration::from_secs(backend_timeout_secs),
            public_base_url,
            tls,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ProxyError::Config(format!("{name} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        for key in [
            "PROXY_TO",
            "TOKEN_ISSUER",
            "ACCESS_CHECKER",
            "BACKEND_TYPE",
            "RUN_MODE",
            "ALLOWED_QUERIES_CONFIG",
            "PROXY_BIND_ADDR",
            "PROXY_BACKEND_TIMEOUT_SECS",
            "PROXY_PUBLIC_BASE_URL",
            "PROXY_TLS_CERT",
            "PROXY_TLS_KEY",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn missing_proxy_to_is_config_error() {
        clear_env();
        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn missing_access_checker_outside_dev_mode_is_config_error() {
        clear_env();
        unsafe {
            std::env::set_var("PROXY_TO", "http://backend");
            std::env::set_var("TOKEN_ISSUER", "http://issuer");
            std::env::set_var("BACKEND_TYPE", "GENERIC");
        }
        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        clear_env();
    }

    #[test]
    fn dev_mode_allows_missing_access_checker() {
        clear_env();
        unsafe {
            std::env::set_var("PROXY_TO", "http://backend");
            std::env::set_var("TOKEN_ISSUER", "http://issuer");
            std::env::set_var("BACKEND_TYPE", "GENERIC");
            std::env::set_var("RUN_MODE", "DEV");
        }
        let cfg = ProxyConfig::from_env().unwrap();
        assert_eq!(cfg.access_checker, AccessCheckerKind::Permissive);
        clear_env();
    }

    #[test]
    fn default_bind_addr_and_timeout() {
        clear_env();
        unsafe {
            std::env::set_var("PROXY_TO", "http://backend");
            std::env::set_var("TOKEN_ISSUER", "http://issuer");
            std::env::set_var("BACKEND_TYPE", "GCP");
            std::env::set_var("ACCESS_CHECKER", "list");
        }
        let cfg = ProxyConfig::from_env().unwrap();
        assert_eq!(cfg.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.backend_timeout, Duration::from_secs(30));
        assert_eq!(cfg.public_base_url, "http://0.0.0.0:8080");
        clear_env();
    }

    #[test]
    fn lone_tls_cert_without_key_is_config_error() {
        clear_env();
        unsafe {
            std::env::set_var("PROXY_TO", "http://backend");
            std::env::set_var("TOKEN_ISSUER", "http://issuer");
            std::env::set_var("BACKEND_TYPE", "GENERIC");
            std::env::set_var("ACCESS_CHECKER", "list");
            std::env::set_var("PROXY_TLS_CERT", "cert.pem");
        }
        let err = ProxyConfig::from_env().unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        clear_env();
    }
}
