//! Session state for the authenticated API client.
//!
//! This module provides:
//! - `Session`: credential bundle plus user profile, persisted as one record
//! - `SessionStore`: where that record lives (file, OS keychain, memory)
//! - `SessionManager`: the Loading / Authenticated / Unauthenticated state machine
//! - `AccessGuard`: gate for protected screens, redirects once per logout

pub mod guard;
pub mod keyring_store;
pub mod session;
pub mod state;
pub mod store;

pub use guard::{AccessGuard, Guarded, Redirector};
pub use keyring_store::KeyringSessionStore;
pub use session::{CredentialBundle, Role, Session, UserProfile};
pub use state::{SessionManager, SessionSnapshot, SessionState};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};
