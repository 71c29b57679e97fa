//! REST API access for the TrustLedger backend.
//!
//! This module provides:
//! - `ApiClient`: the authenticated request pipeline (bearer token, one
//!   refresh-and-retry on 401)
//! - `RefreshCoordinator`: single-flight credential renewal
//! - `AuthBackend`: the login/register/refresh/logout endpoints
//! - `Transport`: the raw HTTP seam underneath the pipeline

pub mod backend;
pub mod client;
pub mod error;
pub mod refresh;
pub mod request;
pub mod transport;

pub use backend::{AuthBackend, AuthGrant, HttpAuthBackend, NewAccount, RefreshedTokens};
pub use client::ApiClient;
pub use error::{ApiError, RefreshError};
pub use refresh::RefreshCoordinator;
pub use request::{ApiRequest, ApiResponse, Attempt, AuthMode};
pub use transport::{HttpTransport, Transport};

pub use reqwest::{Method, StatusCode};
