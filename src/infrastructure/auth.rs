use crate::domain::ports::IdentityVerifier;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct Verification {
    #[serde(default)]
    sub: String,
}

/// Asks the auth service's `/verify` endpoint who a bearer token belongs to.
#[derive(Clone)]
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpIdentityVerifier {
    pub fn new(auth_server: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            verify_url: format!("{}/verify", ensure_protocol(auth_server)),
        }
    }
}

/// Prefixes a bare host with a scheme: plain http for localhost, https otherwise.
pub fn ensure_protocol(server: &str) -> String {
    let server = server.trim_end_matches('/').to_lowercase();
    if server.starts_with("https://") || server.starts_with("http://") {
        server
    } else if server.starts_with("localhost") || server.starts_with("127.0.0.1") {
        format!("http://{server}")
    } else {
        format!("https://{server}")
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, authorization: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.verify_url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| LedgerError::Upstream(format!("Auth service unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(LedgerError::AuthFailure(format!(
                "Auth service answered {}",
                response.status()
            )));
        }
        let verification: Verification = response
            .json()
            .await
            .map_err(|e| LedgerError::AuthFailure(format!("Bad answer from auth service: {e}")))?;
        if verification.sub.is_empty() {
            return Err(LedgerError::AuthFailure(
                "Bad answer from auth service: empty subject".to_string(),
            ));
        }
        Ok(verification.sub)
    }
}

/// A fixed token table, for tests and local runs without an auth service.
#[derive(Default, Clone)]
pub struct StaticIdentityVerifier {
    tokens: HashMap<String, String>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `token` (without the `Bearer ` prefix) as belonging to `public_id`.
    pub fn with_token(mut self, token: &str, public_id: &str) -> Self {
        self.tokens.insert(token.to_string(), public_id.to_string());
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, authorization: &str) -> Result<String> {
        let token = authorization
            .strip_prefix("Bearer ")
            .unwrap_or(authorization)
            .trim();
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| LedgerError::AuthFailure("Unknown token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_protocol() {
        assert_eq!(ensure_protocol("localhost:7000"), "http://localhost:7000");
        assert_eq!(ensure_protocol("auth.example.com/"), "https://auth.example.com");
        assert_eq!(ensure_protocol("HTTP://Auth:80"), "http://auth:80");
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticIdentityVerifier::new().with_token("t0k3n", "u-1");
        assert_eq!(verifier.verify("Bearer t0k3n").await.unwrap(), "u-1");
        assert!(matches!(
            verifier.verify("Bearer nope").await,
            Err(LedgerError::AuthFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_auth_service_is_not_an_auth_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let verifier = HttpIdentityVerifier::new(&addr.to_string());
        assert!(matches!(
            verifier.verify("Bearer t0k3n").await,
            Err(LedgerError::Upstream(_))
        ));
    }
}
