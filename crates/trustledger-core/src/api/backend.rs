//! Session endpoints of the TrustLedger backend: login, register, token
//! refresh and logout.
//!
//! These calls bypass the authenticated pipeline. Login and register must
//! work without a session, refresh is what the pipeline itself falls back
//! on, and logout is best-effort.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiError, RefreshError};
use crate::auth::{CredentialBundle, UserProfile};
use crate::config::ClientConfig;

/// What a successful login or auto-login registration hands back
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub credentials: CredentialBundle,
    pub user: UserProfile,
}

/// Result of a token refresh. The backend may or may not rotate the
/// refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedTokens {
    #[serde(rename = "access")]
    pub access_token: String,
    #[serde(rename = "refresh", default)]
    pub refresh_token: Option<String>,
}

impl RefreshedTokens {
    /// Build the new bundle, keeping the old refresh token when none was issued
    pub fn into_bundle(self, previous_refresh: &str) -> CredentialBundle {
        CredentialBundle {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| previous_refresh.to_string()),
        }
    }
}

/// Account fields accepted by the register endpoint
#[derive(Debug, Clone, Serialize)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, ApiError>;

    /// Create an account. `Some` when the backend logs the new user in.
    async fn register(&self, account: &NewAccount) -> Result<Option<AuthGrant>, ApiError>;

    /// Exchange a refresh token for new credentials. Exactly one network call.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError>;

    /// Ask the server to invalidate the refresh token
    async fn logout(&self, credentials: &CredentialBundle) -> Result<(), ApiError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    user: UserProfile,
    tokens: Option<TokenPair>,
}

#[derive(Deserialize)]
struct TokenPair {
    access: String,
    refresh: String,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenPair(<redacted>)")
    }
}

impl AuthResponse {
    fn into_grant(self) -> Option<AuthGrant> {
        let tokens = self.tokens?;
        let credentials = CredentialBundle::new(tokens.access, tokens.refresh);
        credentials.is_complete().then_some(AuthGrant {
            credentials,
            user: self.user,
        })
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    config: ClientConfig,
}

impl HttpAuthBackend {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .client
            .post(self.config.url(path))
            .header(header::ACCEPT, "application/json")
            .json(body);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        builder.send().await
    }

    /// Login and register both answer `{user, tokens}`; 400/401 mean the
    /// submitted data was refused.
    async fn read_grant(response: reqwest::Response) -> Result<Option<AuthGrant>, ApiError> {
        let status = response.status();
        let body = response.text().await?;
        match status {
            s if s.is_success() => {
                let parsed: AuthResponse = serde_json::from_str(&body)
                    .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse auth response: {}", e)))?;
                Ok(parsed.into_grant())
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                Err(ApiError::LoginRejected(ApiError::truncate_body(&body)))
            }
            s => Err(ApiError::from_status(s, &body)),
        }
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, ApiError> {
        debug!(username, "Logging in");
        let response = self
            .post(&self.config.endpoints.login, &LoginRequest { username, password }, None)
            .await?;

        Self::read_grant(response).await?.ok_or_else(|| {
            ApiError::InvalidResponse("Login response did not include tokens".to_string())
        })
    }

    async fn register(&self, account: &NewAccount) -> Result<Option<AuthGrant>, ApiError> {
        debug!(username = %account.username, "Registering account");
        let response = self
            .post(&self.config.endpoints.register, account, None)
            .await?;
        Self::read_grant(response).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        let response = self
            .post(&self.config.endpoints.refresh, &RefreshRequest { refresh: refresh_token }, None)
            .await
            .map_err(|e| RefreshError::Denied(format!("refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token refresh rejected");
            return Err(RefreshError::Denied(format!(
                "status {}: {}",
                status.as_u16(),
                ApiError::truncate_body(&body)
            )));
        }

        let tokens: RefreshedTokens = response
            .json()
            .await
            .map_err(|e| RefreshError::Denied(format!("unreadable refresh response: {}", e)))?;
        if tokens.access_token.is_empty() {
            return Err(RefreshError::Denied("refresh response had an empty access token".to_string()));
        }
        Ok(tokens)
    }

    async fn logout(&self, credentials: &CredentialBundle) -> Result<(), ApiError> {
        let response = self
            .post(
                &self.config.endpoints.logout,
                &RefreshRequest { refresh: &credentials.refresh_token },
                Some(&credentials.access_token),
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

/// Give up on a refresh call that has not answered within `timeout`
pub(crate) async fn refresh_with_timeout(
    backend: &dyn AuthBackend,
    refresh_token: &str,
    timeout: Duration,
) -> Result<RefreshedTokens, RefreshError> {
    match tokio::time::timeout(timeout, backend.refresh(refresh_token)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Token refresh timed out");
            Err(RefreshError::Denied(format!(
                "refresh timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_login_response() {
        let json = r#"{
            "user": {"id": 4, "username": "alice", "email": "alice@example.org",
                     "first_name": "Alice", "last_name": "Ng", "role": "auditor",
                     "department": null, "is_verified": true},
            "tokens": {"refresh": "r1", "access": "a1"}
        }"#;
        let parsed: AuthResponse = serde_json::from_str(json).expect("auth response should parse");
        let grant = parsed.into_grant().expect("grant");
        assert_eq!(grant.credentials, CredentialBundle::new("a1", "r1"));
        assert_eq!(grant.user.display_name(), "Alice Ng");
    }

    #[test]
    fn test_register_without_tokens_is_not_a_grant() {
        let json = r#"{"user": {"id": 5, "username": "bob", "email": "bob@example.org"}}"#;
        let parsed: AuthResponse = serde_json::from_str(json).expect("auth response should parse");
        assert!(parsed.into_grant().is_none());
    }

    #[test]
    fn test_refreshed_tokens_keep_previous_refresh() {
        let rotated: RefreshedTokens = serde_json::from_str(r#"{"access": "a2", "refresh": "r2"}"#)
            .expect("parse");
        assert_eq!(rotated.into_bundle("r1"), CredentialBundle::new("a2", "r2"));

        let plain: RefreshedTokens = serde_json::from_str(r#"{"access": "a2"}"#).expect("parse");
        assert_eq!(plain.into_bundle("r1"), CredentialBundle::new("a2", "r1"));
    }

    #[test]
    fn test_new_account_skips_missing_phone() {
        let account = NewAccount {
            username: "carol".to_string(),
            email: "carol@example.org".to_string(),
            password: "pw".to_string(),
            password_confirm: "pw".to_string(),
            first_name: "Carol".to_string(),
            last_name: "Diaz".to_string(),
            role: "citizen".to_string(),
            phone_number: None,
        };
        let value = serde_json::to_value(&account).expect("serialize");
        assert!(value.get("phone_number").is_none());
        assert_eq!(value["role"], "citizen");
    }
}
