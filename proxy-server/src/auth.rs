//! C1 Token Verifier: Bearer/JWS parsing, RS256-only enforcement, and a
//! JWKS cache refreshed on a TTL via double-checked locking — the same shape
//! as the teacher's `JwkCache`, generalized with the OIDC-discovery fetch
//! path an external IdP (Keycloak-style) requires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use proxy_core::DecodedToken;
use proxy_core::error::{ProxyError, Result};
use serde::Deserialize;
use tokio::sync::RwLock;

/// How long a fetched JWKS is trusted before the next verification triggers a
/// refresh. A restart also refreshes immediately, satisfying §4.1's weaker
/// "a restart refreshes the key" guarantee as a special case.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

#[derive(Debug, Default)]
struct JwksCache {
    jwks: Option<JwkSet>,
    jwks_uri: Option<String>,
    fetched_at: Option<Instant>,
}

/// C1's public contract: `verify(authorization_header) -> DecodedToken`.
#[derive(Clone)]
pub struct TokenVerifier {
    issuer: String,
    http: reqwest::Client,
    cache: Arc<RwLock<JwksCache>>,
}

impl TokenVerifier {
    pub fn new(issuer: String, http: reqwest::Client) -> Self {
        Self {
            issuer,
            http,
            cache: Arc::new(RwLock::new(JwksCache::default())),
        }
    }

    /// Verify an inbound `Authorization` header value and return its claims.
    /// Any failure is an [`ProxyError::Auth`] — the pipeline maps that to
    /// HTTP 401 with a `WWW-Authenticate: Bearer` response header.
    pub async fn verify(&self, authorization_header: Option<&str>) -> Result<DecodedToken> {
        let header_value = authorization_header
            .ok_or_else(|| ProxyError::Auth("missing Authorization header".into()))?;
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ProxyError::Auth("Authorization header must use 'Bearer ' prefix".into()))?;
        if token.is_empty() {
            return Err(ProxyError::Auth("empty bearer token".into()));
        }

        let header = decode_header(token)
            .map_err(|e| ProxyError::Auth(format!("malformed JWS header: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(ProxyError::Auth(format!(
                "unsupported JWS alg '{:?}' (only RS256 is accepted)",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| ProxyError::Auth("JWS header missing 'kid'".into()))?;

        let jwks = self.jwks().await?;
        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| ProxyError::Auth(format!("no JWK found for kid '{kid}'")))?;
        let decoding_key = decoding_key_from_jwk(jwk)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;
        // `exp` is validated when present but not required — §4.1 permits an
        // absent expiry, subject to configuration (we always permit it here;
        // the backend is the final authority on resource access regardless).
        validation.required_spec_claims.clear();

        let data = decode::<HashMap<String, serde_json::Value>>(token, &decoding_key, &validation)
            .map_err(|e| ProxyError::Auth(format!("JWS verification failed: {e}")))?;

        let claims = data.claims;
        let subject = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let expiry = claims.get("exp").and_then(|v| v.as_i64());

        Ok(DecodedToken {
            issuer: self.issuer.clone(),
            subject,
            expiry,
            claims,
        })
    }

    async fn jwks(&self) -> Result<JwkSet> {
        if let Some(jwks) = self.cached_jwks().await {
            return Ok(jwks);
        }

        let mut cache = self.cache.write().await;
        if let (Some(jwks), Some(fetched_at)) = (&cache.jwks, cache.fetched_at)
            && fetched_at.elapsed() <= JWKS_CACHE_TTL
        {
            return Ok(jwks.clone());
        }

        let jwks_uri = match &cache.jwks_uri {
            Some(uri) => uri.clone(),
            None => {
                let uri = self.fetch_jwks_uri().await?;
                cache.jwks_uri = Some(uri.clone());
                uri
            }
        };
        let jwks = self.fetch_jwks(&jwks_uri).await?;
        cache.jwks = Some(jwks.clone());
        cache.fetched_at = Some(Instant::now());
        Ok(jwks)
    }

    async fn cached_jwks(&self) -> Option<JwkSet> {
        let cache = self.cache.read().await;
        match (&cache.jwks, cache.fetched_at) {
            (Some(jwks), Some(fetched_at)) if fetched_at.elapsed() <= JWKS_CACHE_TTL => {
                Some(jwks.clone())
            }
            _ => None,
        }
    }

    async fn fetch_jwks_uri(&self) -> Result<String> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer.trim_end_matches('/')
        );
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProxyError::Backend(format!("OIDC discovery failed: {e}")))?;
        if !res.status().is_success() {
            return Err(ProxyError::Backend(format!(
                "OIDC discovery returned HTTP {}",
                res.status()
            )));
        }
        let doc: OidcDiscovery = res
            .json()
            .await
            .map_err(|e| ProxyError::Backend(format!("OIDC discovery JSON parse failed: {e}")))?;
        Ok(doc.jwks_uri)
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet> {
        let res = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| ProxyError::Backend(format!("JWKS fetch failed: {e}")))?;
        if !res.status().is_success() {
            return Err(ProxyError::Backend(format!(
                "JWKS fetch returned HTTP {}",
                res.status()
            )));
        }
        res.json::<JwkSet>()
            .await
            .map_err(|e| ProxyError::Backend(format!("JWKS JSON parse failed: {e}")))
    }
}

fn decoding_key_from_jwk(jwk: &jsonwebtoken::jwk::Jwk) -> Result<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map_err(|e| ProxyError::Auth(format!("failed to build RSA decoding key: {e}"))),
        _ => Err(ProxyError::Auth("only RSA JWKs are supported".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("https://issuer.example.com".to_string(), reqwest::Client::new())
    }

    #[tokio::test]
    async fn missing_authorization_header_fails() {
        let err = verifier().verify(None).await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[tokio::test]
    async fn non_bearer_prefix_fails() {
        let err = verifier().verify(Some("Basic abc123")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[tokio::test]
    async fn empty_bearer_token_fails() {
        let err = verifier().verify(Some("Bearer ")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[tokio::test]
    async fn malformed_jws_fails_before_any_network_call() {
        let err = verifier().verify(Some("Bearer not.a.jwt")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[tokio::test]
    async fn non_rs256_header_is_rejected_without_jwks_fetch() {
        // header claims HS256; base64url("{"alg":"HS256","typ":"JWT"}")."{}".""
        let header = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            br#"{"alg":"HS256","typ":"JWT"}"#,
        );
        let payload = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, b"{}");
        let token = format!("Bearer {header}.{payload}.sig");
        let err = verifier().verify(Some(&token)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }
}
