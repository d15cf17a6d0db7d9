//! SMART-on-FHIR scope parsing (§4.4.3), shared by the SMART-scope checker and
//! by the patient-compartment checker's additional scope gate.

/// The FHIR operation a request requires permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Create,
    Read,
    Update,
    Delete,
    Search,
}

/// `patient` or `user` — the scope's principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Patient,
    User,
}

impl Principal {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "patient" => Some(Principal::Patient),
            "user" => Some(Principal::User),
            _ => None,
        }
    }
}

/// A single parsed `{principal}/{resourceType|*}.{perm}` scope token. Malformed
/// tokens never parse — per §4.4.3 a malformed scope is ignored, never grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartScope {
    pub principal: Principal,
    /// `None` means `*` — matches any resource type.
    pub resource_type: Option<String>,
    permissions: Vec<Permission>,
}

impl SmartScope {
    pub fn parse(token: &str) -> Option<Self> {
        let (principal_str, rest) = token.split_once('/')?;
        let principal = Principal::parse(principal_str)?;
        let (resource_str, perm_str) = rest.split_once('.')?;
        if resource_str.is_empty() || perm_str.is_empty() {
            return None;
        }
        let resource_type = if resource_str == "*" {
            None
        } else {
            Some(resource_str.to_string())
        };
        let permissions = parse_permissions(perm_str)?;
        Some(Self {
            principal,
            resource_type,
            permissions,
        })
    }

    pub fn matches(&self, principal: Principal, resource_type: &str, perm: Permission) -> bool {
        self.principal == principal
            && self
                .resource_type
                .as_deref()
                .is_none_or(|rt| rt == resource_type)
            && self.permissions.contains(&perm)
    }
}

/// Parse the perm portion of a scope token. v1 tokens are `read`, `write`, or
/// `*`; v2 tokens are any combination of `c`/`r`/`u`/`d`/`s` letters (e.g.
/// `cruds`, `rs`). A token that is neither a known v1 keyword nor composed
/// entirely of v2 letters is malformed.
fn parse_permissions(perm_str: &str) -> Option<Vec<Permission>> {
    match perm_str {
        "*" => Some(vec![
            Permission::Create,
            Permission::Read,
            Permission::Update,
            Permission::Delete,
            Permission::Search,
        ]),
        "read" => Some(vec![Permission::Read, Permission::Search]),
        "write" => Some(vec![Permission::Create, Permission::Update, Permission::Delete]),
        _ => {
            let mut perms = Vec::new();
            for c in perm_str.chars() {
                perms.push(match c {
                    'c' => Permission::Create,
                    'r' => Permission::Read,
                    'u' => Permission::Update,
                    'd' => Permission::Delete,
                    's' => Permission::Search,
                    _ => return None,
                });
            }
            if perms.is_empty() {
                None
            } else {
                Some(perms)
            }
        }
    }
}

/// Parse a whitespace-separated `scope` claim value into its component
/// tokens, silently dropping any that fail to parse (§4.4.3: malformed scopes
/// are ignored, never contribute to a grant).
pub fn parse_scope_claim(scope: &str) -> Vec<SmartScope> {
    scope
        .split_whitespace()
        .filter_map(SmartScope::parse)
        .collect()
}

/// The required permission for a given HTTP method, per §4.4.3/§4.4.4.
pub fn required_permission(method: crate::request_view::RequestMethod, is_search: bool) -> Permission {
    use crate::request_view::RequestMethod;
    match method {
        RequestMethod::Get if is_search => Permission::Search,
        RequestMethod::Get => Permission::Read,
        RequestMethod::Post => Permission::Create,
        RequestMethod::Put | RequestMethod::Patch => Permission::Update,
        RequestMethod::Delete => Permission::Delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_tokens() {
        let s = SmartScope::parse("user/Patient.read").unwrap();
        assert_eq!(s.principal, Principal::User);
        assert_eq!(s.resource_type.as_deref(), Some("Patient"));
        assert!(s.matches(Principal::User, "Patient", Permission::Read));
        assert!(s.matches(Principal::User, "Patient", Permission::Search));
        assert!(!s.matches(Principal::User, "Patient", Permission::Create));
    }

    #[test]
    fn parses_v2_combination_tokens() {
        let s = SmartScope::parse("patient/Observation.cruds").unwrap();
        assert!(s.matches(Principal::Patient, "Observation", Permission::Create));
        assert!(s.matches(Principal::Patient, "Observation", Permission::Delete));
    }

    #[test]
    fn wildcard_resource_matches_anything() {
        let s = SmartScope::parse("user/*.read").unwrap();
        assert!(s.matches(Principal::User, "Patient", Permission::Read));
        assert!(s.matches(Principal::User, "Observation", Permission::Read));
    }

    #[test]
    fn malformed_tokens_are_dropped_not_errored() {
        let scopes = parse_scope_claim("user/Patient.read garbage user/Observation.bogus patient/*.write");
        assert_eq!(scopes.len(), 2);
    }

    #[test]
    fn principal_mismatch_never_matches() {
        let s = SmartScope::parse("patient/Patient.read").unwrap();
        assert!(!s.matches(Principal::User, "Patient", Permission::Read));
    }
}
