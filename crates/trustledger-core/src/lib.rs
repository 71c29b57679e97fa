//! TrustLedger client session core.
//!
//! Keeps the dashboard's API calls authenticated: the session is restored
//! from disk at startup, every request carries the current bearer token,
//! expired tokens are renewed with a single shared refresh, and a failed
//! refresh logs the user out and sends them back to the login screen.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use trustledger_core::{ApiClient, ClientConfig};
//!
//! let config = ClientConfig::load()?;
//! let api = ApiClient::from_config(&config, config.session_store()?)?;
//! api.session().sign_in("alice", "correct horse").await?;
//! let projects: serde_json::Value = api.get_json("/core/projects/").await?;
//! # let _ = projects;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, AuthMode, RefreshCoordinator, RefreshError};
pub use auth::{
    AccessGuard, CredentialBundle, Guarded, Redirector, Session, SessionManager, SessionState,
    SessionStore, UserProfile,
};
pub use config::ClientConfig;
