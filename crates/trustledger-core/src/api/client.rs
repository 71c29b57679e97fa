//! Authenticated request pipeline for the TrustLedger REST API.
//!
//! `ApiClient` attaches the session's bearer token to every call. A 401 on
//! the first attempt triggers one (shared) token refresh and one retry with
//! the new token; whatever the retry returns is final. Other failures pass
//! through untouched.

use std::sync::Arc;

use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{
    ApiError, ApiRequest, ApiResponse, Attempt, AuthBackend, AuthMode, HttpAuthBackend,
    HttpTransport, RefreshCoordinator, Transport,
};
use crate::auth::{SessionManager, SessionStore, UserProfile};
use crate::config::ClientConfig;

/// Result of one attempt
enum Outcome {
    Done(ApiResponse),
    /// First attempt came back 401
    NeedsRefresh,
}

/// Clone is cheap - all parts are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    manager: Arc<SessionManager>,
    refresher: RefreshCoordinator,
    profile_path: String,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, manager: Arc<SessionManager>, refresher: RefreshCoordinator) -> Self {
        Self {
            transport,
            manager,
            refresher,
            profile_path: crate::config::Endpoints::default().profile,
        }
    }

    /// Wire up the HTTP transport, session backend, state machine and
    /// refresh coordinator from a config, sharing one connection pool.
    pub fn from_config(config: &ClientConfig, store: Arc<dyn SessionStore>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        let backend: Arc<dyn AuthBackend> =
            Arc::new(HttpAuthBackend::with_client(client.clone(), config.clone()));
        let manager = Arc::new(SessionManager::new(store, backend.clone()));
        let refresher = RefreshCoordinator::new(manager.clone(), backend, config.refresh_timeout());
        let transport = Arc::new(HttpTransport::with_client(client, config.base_url.clone()));

        let mut api = Self::new(transport, manager, refresher);
        api.profile_path = config.endpoints.profile.clone();
        Ok(api)
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    /// Send a request through the pipeline. Non-2xx answers become errors.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.manager.initialize();

        let token = self.bearer_for(&request)?;
        match self.attempt(&request, Attempt::First, token.as_deref()).await? {
            Outcome::Done(response) => Ok(response),
            Outcome::NeedsRefresh => {
                debug!(path = %request.path, "Unauthorized, refreshing credentials");
                let renewed = self.refresher.refresh_stale(token.as_deref()).await?;
                match self
                    .attempt(&request, Attempt::Retry, Some(&renewed.access_token))
                    .await?
                {
                    Outcome::Done(response) => Ok(response),
                    Outcome::NeedsRefresh => Err(ApiError::Unauthorized),
                }
            }
        }
    }

    /// Token to attach, or `AuthRequired` when the request needs a session
    /// and there is none.
    fn bearer_for(&self, request: &ApiRequest) -> Result<Option<String>, ApiError> {
        match request.auth {
            AuthMode::Anonymous => Ok(None),
            AuthMode::Optional => Ok(self.manager.access_token()),
            AuthMode::Required => self.manager.access_token().map(Some).ok_or(ApiError::AuthRequired),
        }
    }

    async fn attempt(&self, request: &ApiRequest, attempt: Attempt, bearer: Option<&str>) -> Result<Outcome, ApiError> {
        let response = self.transport.execute(request, bearer).await?;

        if response.is_unauthorized() && request.auth != AuthMode::Anonymous {
            match attempt {
                Attempt::First => return Ok(Outcome::NeedsRefresh),
                Attempt::Retry => {
                    warn!(path = %request.path, "Still unauthorized after refresh");
                    return Err(ApiError::Unauthorized);
                }
            }
        }

        response.error_for_status().map(Outcome::Done)
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(body)?).await?.json()
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.send(ApiRequest::patch(path).json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }

    // ===== Profile =====

    /// Fetch the logged-in user's profile
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        self.send(ApiRequest::get(self.profile_path.as_str()).auth(AuthMode::Required))
            .await?
            .json()
    }

    /// Fetch the profile and store it with the session
    pub async fn refresh_profile(&self) -> Result<UserProfile, ApiError> {
        let user = self.fetch_profile().await?;
        if !self.manager.update_profile(user.clone())? {
            return Err(ApiError::AuthRequired);
        }
        Ok(user)
    }
}

// ============================================================================
// Tests
// ============================================================================
