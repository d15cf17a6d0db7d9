use std::fmt;

/// FHIR REST methods this proxy understands (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Patch => "PATCH",
            RequestMethod::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(RequestMethod::Get),
            "POST" => Some(RequestMethod::Post),
            "PUT" => Some(RequestMethod::Put),
            "PATCH" => Some(RequestMethod::Patch),
            "DELETE" => Some(RequestMethod::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read-only projection of an inbound HTTP request (§3). The server crate
/// builds one of these from an axum `Request` before C1/C3/C4 ever see it;
/// none of its fields depend on axum types, so the decision logic in this
/// crate stays free of any web-framework dependency.
#[derive(Debug, Clone)]
pub struct RequestView {
    pub method: RequestMethod,
    pub path: String,
    pub url: String,
    /// Null on Bundle POSTs (the bundle carries per-entry resource types instead).
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Query-parameter name → ordered list of values; order of insertion is
    /// preserved so a rendered mutation matches what the client sent.
    pub query_params: Vec<(String, Vec<String>)>,
    pub headers: Vec<(String, String)>,
    /// `None` until an access-checker demands inspection; the pipeline
    /// materializes the body in memory exactly once (§3 invariant) and every
    /// collaborator after that shares this same `Vec`.
    body: Option<Vec<u8>>,
}

impl RequestView {
    pub fn new(
        method: RequestMethod,
        path: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            url: url.into(),
            resource_type: None,
            resource_id: None,
            query_params: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values supplied for a query-parameter name, or an empty slice if absent.
    pub fn query_values(&self, name: &str) -> &[String] {
        self.query_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// `Some(v)` iff the request carries exactly one value for `name` — the
    /// condition §4.2's search-parameter algorithm gates on before treating a
    /// value as a single candidate patient id.
    pub fn single_query_value(&self, name: &str) -> Option<&str> {
        match self.query_values(name) {
            [v] => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn query_param_names(&self) -> impl Iterator<Item = &str> {
        self.query_params.iter().map(|(k, _)| k.as_str())
    }
}
