//! C4 Access-Checker Family: one shared `check()` contract, dispatched
//! through a tagged variant rather than a trait object — the proxy selects
//! exactly one variant at startup and never swaps it at runtime, so the
//! "interface + tagged variant" shape fits better than dynamic dispatch.

pub mod access_list;
pub mod patient_compartment;
pub mod permissive;
pub mod role_permission;
pub mod sync_strategy;

use proxy_core::decision::{AccessDecision, DecodedToken};
use proxy_core::error::Result;
use proxy_core::inspector::ResourceInspector;
use proxy_core::request_view::RequestView;

use crate::backend::BackendClient;

pub use access_list::AccessListChecker;
pub use patient_compartment::PatientCompartmentChecker;
pub use permissive::PermissiveChecker;
pub use role_permission::RolePermissionChecker;
pub use sync_strategy::SyncStrategyChecker;

#[derive(Clone)]
pub enum AccessChecker {
    PatientCompartment(PatientCompartmentChecker),
    AccessList(AccessListChecker),
    RolePermission(RolePermissionChecker),
    SyncStrategy(SyncStrategyChecker),
    Permissive(PermissiveChecker),
}

impl AccessChecker {
    pub async fn check(
        &self,
        view: &RequestView,
        token: &DecodedToken,
        inspector: &ResourceInspector,
        backend: &BackendClient,
    ) -> Result<AccessDecision> {
        match self {
            AccessChecker::PatientCompartment(c) => c.check(view, token, inspector),
            AccessChecker::AccessList(c) => c.check(view, token, inspector, backend).await,
            AccessChecker::RolePermission(c) => c.check(view, token, inspector),
            AccessChecker::SyncStrategy(c) => c.check(view, token, inspector, backend).await,
            AccessChecker::Permissive(c) => c.check(),
        }
    }
}
