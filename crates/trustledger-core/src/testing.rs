//! Fakes shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::Semaphore;

use crate::api::{
    ApiError, ApiRequest, ApiResponse, AuthBackend, AuthGrant, NewAccount, RefreshError,
    RefreshedTokens, Transport,
};
use crate::auth::{CredentialBundle, Redirector, UserProfile};

pub fn alice() -> UserProfile {
    UserProfile {
        id: 1,
        username: "alice".to_string(),
        email: "alice@example.org".to_string(),
        first_name: Some("Alice".to_string()),
        last_name: None,
        role: None,
    }
}

pub fn bundle(n: u32) -> CredentialBundle {
    CredentialBundle::new(format!("access-{}", n), format!("refresh-{}", n))
}

// ============================================================================
// Backend
// ============================================================================

/// Scripted session endpoints. Refresh answers come from a queue; an empty
/// queue denies. An optional gate holds refresh calls until permits arrive.
#[derive(Default)]
pub struct FakeBackend {
    login_grant: Mutex<Option<AuthGrant>>,
    register_grant: Mutex<Option<AuthGrant>>,
    refresh_results: Mutex<VecDeque<Result<RefreshedTokens, RefreshError>>>,
    refresh_tokens_seen: Mutex<Vec<String>>,
    refresh_gate: Mutex<Option<Arc<Semaphore>>>,
    refresh_hangs: AtomicBool,
    refresh_panics: AtomicBool,
    logout_calls: AtomicUsize,
    logout_fails: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_login_grant(&self, credentials: CredentialBundle, user: UserProfile) {
        *self.login_grant.lock() = Some(AuthGrant { credentials, user });
    }

    pub fn set_register_grant(&self, credentials: CredentialBundle, user: UserProfile) {
        *self.register_grant.lock() = Some(AuthGrant { credentials, user });
    }

    /// Next refresh returns `bundle`, rotating the refresh token too
    pub fn push_refresh(&self, bundle: CredentialBundle) {
        self.refresh_results.lock().push_back(Ok(RefreshedTokens {
            access_token: bundle.access_token,
            refresh_token: Some(bundle.refresh_token),
        }));
    }

    pub fn push_refresh_error(&self, err: RefreshError) {
        self.refresh_results.lock().push_back(Err(err));
    }

    /// Hold refresh calls until the returned semaphore gets permits
    pub fn gate_refresh(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.refresh_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn hang_refresh(&self) {
        self.refresh_hangs.store(true, Ordering::SeqCst);
    }

    /// Make the refresh task die instead of answering
    pub fn panic_refresh(&self) {
        self.refresh_panics.store(true, Ordering::SeqCst);
    }

    pub fn fail_logout(&self) {
        self.logout_fails.store(true, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_tokens_seen.lock().len()
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock().clone()
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthBackend for FakeBackend {
    async fn login(&self, _username: &str, _password: &str) -> Result<AuthGrant, ApiError> {
        self.login_grant
            .lock()
            .clone()
            .ok_or_else(|| ApiError::LoginRejected("invalid credentials".to_string()))
    }

    async fn register(&self, _account: &NewAccount) -> Result<Option<AuthGrant>, ApiError> {
        Ok(self.register_grant.lock().clone())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        self.refresh_tokens_seen.lock().push(refresh_token.to_string());

        if self.refresh_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.refresh_panics.load(Ordering::SeqCst) {
            panic!("refresh backend crashed");
        }
        let gate = self.refresh_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.refresh_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(RefreshError::Denied("token_not_valid".to_string())))
    }

    async fn logout(&self, _credentials: &CredentialBundle) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.logout_fails.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("logout unavailable".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub path: String,
    pub bearer: Option<String>,
}

/// Answers 200 for anonymous requests and for accepted bearer tokens, 401
/// for everything else. Paths listed with `fail_path` answer 500.
#[derive(Default)]
pub struct FakeTransport {
    accepted: Mutex<HashSet<String>>,
    failing_paths: Mutex<HashSet<String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, token: &str) {
        self.accepted.lock().insert(token.to_string());
    }

    pub fn fail_path(&self, path: &str) {
        self.failing_paths.lock().insert(path.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_with(&self, token: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.bearer.as_deref() == Some(token))
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
        self.calls.lock().push(RecordedCall {
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
        });
        // Let other tasks run between sending and answering
        tokio::task::yield_now().await;

        if self.failing_paths.lock().contains(&request.path) {
            return Ok(ApiResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"));
        }

        let allowed = match bearer {
            None => request.auth == crate::api::AuthMode::Anonymous || request.path.starts_with("/public"),
            Some(token) => self.accepted.lock().contains(token),
        };
        if allowed {
            let body = serde_json::json!({ "path": request.path }).to_string();
            Ok(ApiResponse::new(StatusCode::OK, body))
        } else {
            Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"detail": "Given token not valid for any token type"}"#,
            ))
        }
    }
}

// ============================================================================
// Redirector
// ============================================================================

#[derive(Default)]
pub struct RecordingRedirector {
    targets: Mutex<Vec<String>>,
}

impl RecordingRedirector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().clone()
    }
}

impl Redirector for RecordingRedirector {
    fn redirect(&self, target: &str) {
        self.targets.lock().push(target.to_string());
    }
}
