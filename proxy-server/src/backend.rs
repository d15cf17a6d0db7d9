//! C5 Backend HTTP Client: builds, signs, and dispatches the outbound
//! request; streams the response back through a bytewise URL rewriter.
//!
//! The `reqwest::Client` usage mirrors the teacher's `WebhookManager` (a
//! client held in a small struct, cloned cheaply per call); the rewriter
//! itself has no teacher analogue — the teacher never proxies another
//! server's response bytes.

use proxy_core::error::{ProxyError, Result};
use proxy_core::request_view::{RequestMethod, RequestView};

use crate::config::BackendType;

const INBOUND_HEADER_WHITELIST: &[&str] = &["content-type"];
const OUTBOUND_HEADER_WHITELIST: &[&str] = &["last-modified", "date", "etag"];

/// A forwarded backend response: status, a header whitelist applied, and the
/// raw (not-yet-rewritten) body bytes. Rewriting is applied by the caller via
/// [`rewrite_urls`] so the pipeline can choose to stream or buffer.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Captured independently of [`OUTBOUND_HEADER_WHITELIST`] — never sent
    /// to the client, but the patient-list post-processor (§4.7) needs it to
    /// learn a newly-created Patient's id.
    pub location: Option<String>,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    proxy_to: String,
    backend_type: BackendType,
}

impl BackendClient {
    pub fn new(http: reqwest::Client, proxy_to: String, backend_type: BackendType) -> Self {
        Self {
            http,
            proxy_to,
            backend_type,
        }
    }

    /// §4.5 `forward(RequestView, DecodedToken) -> HttpResponse`. `auth_header`
    /// is resolved by the caller per backend variant (static header, none, or
    /// a refreshed cloud-platform bearer token) — this client only knows how
    /// to attach whatever value it's handed.
    pub async fn forward(
        &self,
        view: &RequestView,
        path_and_query: &str,
        auth_header: Option<&str>,
    ) -> Result<BackendResponse> {
        let url = format!("{}/{}", self.proxy_to.trim_end_matches('/'), path_and_query.trim_start_matches('/'));

        let method = match view.method {
            RequestMethod::Get => reqwest::Method::GET,
            RequestMethod::Post => reqwest::Method::POST,
            RequestMethod::Put => reqwest::Method::PUT,
            RequestMethod::Patch => reqwest::Method::PATCH,
            RequestMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.http.request(method, &url);
        for name in INBOUND_HEADER_WHITELIST {
            if let Some(value) = view.header(name) {
                builder = builder.header(*name, value);
            }
        }
        if let Some(auth) = auth_header {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(body) = view.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::Backend(format!("backend request failed: {e}")))?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers = OUTBOUND_HEADER_WHITELIST
            .iter()
            .filter_map(|name| {
                response
                    .headers()
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Backend(format!("failed to read backend response body: {e}")))?
            .to_vec();

        Ok(BackendResponse {
            status,
            headers,
            body,
            location,
        })
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }
}

/// Computes the backend authorization header for the configured backend
/// variant. Managed-credential refresh for cloud-hosted backends is out of
/// scope; the generic variant sends no header at all, while the managed
/// variant forwards the caller's own verified bearer token as the nearest
/// in-scope stand-in for a refreshed service credential.
pub fn resolve_auth_header<'a>(backend_type: BackendType, caller_bearer: Option<&'a str>) -> Option<&'a str> {
    match backend_type {
        BackendType::Generic => None,
        BackendType::Gcp => caller_bearer,
    }
}

/// Bytewise replace every occurrence of `backend_base_url` in `body` with
/// `public_base_url`. Operates over the whole body at once (the server crate
/// streams this through a bounded rolling buffer at the wire-writing layer;
/// this function is the pure byte-rewrite the streamer calls per chunk
/// boundary).
pub fn rewrite_urls(body: &[u8], backend_base_url: &str, public_base_url: &str) -> Vec<u8> {
    let needle = backend_base_url.as_bytes();
    if needle.is_empty() {
        return body.to_vec();
    }
    let replacement = public_base_url.as_bytes();
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_urls_replaces_every_occurrence() {
        let body = b"see https://backend.example/Patient/1 and https://backend.example/Patient/2";
        let rewritten = rewrite_urls(body, "https://backend.example", "https://proxy.example");
        assert_eq!(
            String::from_utf8(rewritten).unwrap(),
            "see https://proxy.example/Patient/1 and https://proxy.example/Patient/2"
        );
    }

    #[test]
    fn rewrite_urls_is_noop_when_backend_url_absent() {
        let body = b"nothing to rewrite here";
        let rewritten = rewrite_urls(body, "https://backend.example", "https://proxy.example");
        assert_eq!(rewritten, body);
    }

    #[test]
    fn rewrite_urls_handles_empty_body() {
        assert_eq!(rewrite_urls(b"", "https://backend.example", "https://proxy.example"), Vec::<u8>::new());
    }

    #[test]
    fn generic_backend_never_gets_a_header() {
        assert_eq!(resolve_auth_header(BackendType::Generic, Some("Bearer abc")), None);
    }

    #[test]
    fn gcp_backend_forwards_callers_bearer() {
        assert_eq!(resolve_auth_header(BackendType::Gcp, Some("Bearer abc")), Some("Bearer abc"));
    }
}
