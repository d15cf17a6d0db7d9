//! Dev-mode permissive checker (§6 `RUN_MODE=DEV` with `ACCESS_CHECKER`
//! unset). Grants everything; selectable only when the config layer has
//! already confirmed `RUN_MODE=DEV`.

use proxy_core::decision::AccessDecision;
use proxy_core::error::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveChecker;

impl PermissiveChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self) -> Result<AccessDecision> {
        Ok(AccessDecision::granted())
    }
}
