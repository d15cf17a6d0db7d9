//! Query-string parsing for the search-parameter inspection algorithm (§4.2).
//!
//! Deliberately narrower than a full FHIR search-parameter parser: this proxy
//! never evaluates a search itself, it only needs to (a) find candidate
//! patient ids carried in compartment-restricted parameters and (b) reject
//! modifiers that could let a caller bypass that scoping.

use crate::error::{ProxyError, Result};

/// Search modifiers that can resolve references the proxy never inspects
/// (`_include`/`_revinclude` pull in referenced resources; `_has` reverses
/// the direction of a search entirely). Always rejected — see §4.2.
const RESERVED_MODIFIERS: &[&str] = &["_include", "_revinclude", "_has"];

/// A parsed query string: parameter name → ordered list of raw values (after
/// percent-decoding, before comma-splitting).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    params: Vec<(String, Vec<String>)>,
}

impl SearchQuery {
    /// Parse `query_string` (the part of the URL after `?`, no leading `?`).
    /// Fails with [`ProxyError::InvalidRequest`] on a reserved modifier or a
    /// chained parameter (`name:Type.field=value`) — per §4.2 these can
    /// bypass compartment scoping and are never forwarded.
    pub fn parse(query_string: &str) -> Result<Self> {
        let mut params: Vec<(String, Vec<String>)> = Vec::new();
        for pair in query_string.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key)
                .map_err(|e| ProxyError::InvalidRequest(format!("malformed query key: {e}")))?;
            let value = urlencoding::decode(value)
                .map_err(|e| ProxyError::InvalidRequest(format!("malformed query value: {e}")))?;
            reject_dangerous(&key)?;
            match params.iter_mut().find(|(k, _)| k == key.as_ref()) {
                Some((_, values)) => values.push(value.to_string()),
                None => params.push((key.to_string(), vec![value.to_string()])),
            }
        }
        Ok(Self { params })
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(k, _)| k.as_str())
    }

    /// `values(name)` split further on commas, matching FHIR's union-of-values
    /// search semantics (`subject=a,b` means "subject is a OR b").
    pub fn union_values(&self, name: &str) -> Vec<String> {
        self.values(name)
            .iter()
            .flat_map(|v| v.split(','))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn reject_dangerous(key: &str) -> Result<()> {
    // `_has:Observation:patient:code=x` and `_include:iterate=...` are still
    // reserved modifiers — the base name before the first `:` is what names
    // the modifier, colon suffixes only refine it.
    let base = key.split(':').next().unwrap_or(key);
    if RESERVED_MODIFIERS.contains(&base) {
        return Err(ProxyError::InvalidRequest(format!(
            "search modifier '{key}' is not permitted"
        )));
    }
    if let Some((_, modifier)) = key.split_once(':')
        && modifier.contains('.')
    {
        return Err(ProxyError::InvalidRequest(format!(
            "chained search parameter '{key}' is not permitted"
        )));
    }
    Ok(())
}

/// Parse a FHIR reference-valued search parameter's value into the bare id,
/// accepting both `123` and `Patient/123` forms (§4.2: "parse it as a FHIR
/// identifier").
pub fn reference_value_id(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_params() {
        let q = SearchQuery::parse("subject=Patient%2F1&status=final").unwrap();
        assert_eq!(q.values("subject"), &["Patient/1".to_string()]);
        assert_eq!(q.values("status"), &["final".to_string()]);
    }

    #[test]
    fn rejects_include_and_revinclude() {
        assert!(SearchQuery::parse("_include=Patient:organization").is_err());
        assert!(SearchQuery::parse("_revinclude=Observation:subject").is_err());
    }

    #[test]
    fn rejects_has_modifier() {
        assert!(SearchQuery::parse("_has:Observation:patient:status=final").is_err());
    }

    #[test]
    fn rejects_include_iterate_modifier() {
        assert!(SearchQuery::parse("_include:iterate=Patient:organization").is_err());
        assert!(SearchQuery::parse("_revinclude:iterate=Observation:subject").is_err());
    }

    #[test]
    fn rejects_chained_parameter() {
        assert!(SearchQuery::parse("subject:Patient.name=Doe").is_err());
    }

    #[test]
    fn allows_non_chain_modifier() {
        let q = SearchQuery::parse("name:exact=John").unwrap();
        assert_eq!(q.values("name:exact"), &["John".to_string()]);
    }

    #[test]
    fn union_values_splits_on_comma() {
        let q = SearchQuery::parse("subject=P1,P2").unwrap();
        assert_eq!(q.union_values("subject"), vec!["P1".to_string(), "P2".to_string()]);
    }

    #[test]
    fn reference_value_id_strips_type_prefix() {
        assert_eq!(reference_value_id("Patient/123"), "123");
        assert_eq!(reference_value_id("123"), "123");
    }
}
