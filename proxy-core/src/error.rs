use thiserror::Error;

use crate::operation_outcome::{IssueType, OperationOutcome};

/// Every fallible boundary in the proxy (verify/check/inspect/forward/postProcess)
/// returns one of these. `Config` is the only variant that never becomes an HTTP
/// response — it is raised at startup and the process exits before binding.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status this error maps to. `Config` has none — callers must never
    /// route it through the HTTP response path.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Auth(_) => 401,
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::Denied(_) => 403,
            ProxyError::Backend(_) => 502,
            ProxyError::Config(_) => unreachable!("ConfigError must abort startup, not respond"),
        }
    }

    pub fn to_operation_outcome(&self) -> OperationOutcome {
        match self {
            ProxyError::Auth(msg) => OperationOutcome::unauthorized(msg.clone()),
            ProxyError::InvalidRequest(msg) => OperationOutcome::invalid_resource(msg.clone()),
            ProxyError::Denied(msg) => OperationOutcome::forbidden(msg.clone()),
            ProxyError::Backend(msg) => OperationOutcome::error(IssueType::Transient, msg.clone()),
            ProxyError::Config(msg) => OperationOutcome::error(IssueType::Exception, msg.clone()),
        }
    }
}
