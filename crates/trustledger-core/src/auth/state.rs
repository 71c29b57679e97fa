use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{CredentialBundle, Session, SessionStore, StoreError, UserProfile};
use crate::api::{ApiError, AuthBackend, NewAccount};

/// Observable session state.
///
/// `Loading` is only ever the initial state: once the store has been read
/// the manager never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Authenticated,
    Unauthenticated,
}

/// Published state plus a counter bumped on every visible transition, so
/// watchers can tell two separate logouts apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    /// Startup load found a session
    Restored,
    /// Startup load found nothing
    NotFound,
    LoggedIn,
    LoggedOut,
    /// Refresh failed
    Expired,
}

/// The legal transitions. Anything else is refused.
fn next_state(from: SessionState, event: Event) -> Option<SessionState> {
    use SessionState::*;
    match (from, event) {
        (Loading, Event::Restored) => Some(Authenticated),
        (Loading, Event::NotFound) => Some(Unauthenticated),
        (Unauthenticated, Event::LoggedIn) => Some(Authenticated),
        (Authenticated, Event::LoggedOut) | (Authenticated, Event::Expired) => Some(Unauthenticated),
        _ => None,
    }
}

struct Inner {
    state: SessionState,
    epoch: u64,
    session: Option<Session>,
}

/// Session state machine and sole writer of the [`SessionStore`].
///
/// Every store mutation happens under `inner`, so readers of the in-memory
/// session and of the store never see a half-applied change.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn AuthBackend>,
    inner: Mutex<Inner>,
    tx: watch::Sender<SessionSnapshot>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, backend: Arc<dyn AuthBackend>) -> Self {
        let initial = SessionSnapshot {
            state: SessionState::Loading,
            epoch: 0,
        };
        let (tx, _rx) = watch::channel(initial);
        Self {
            store,
            backend,
            inner: Mutex::new(Inner {
                state: SessionState::Loading,
                epoch: 0,
                session: None,
            }),
            tx,
        }
    }

    /// Read the store once and leave `Loading`. Later calls do nothing.
    pub fn initialize(&self) -> SessionState {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Loading {
            return inner.state;
        }

        let event = match self.store.load() {
            Some(session) => {
                info!(username = %session.user.username, "Restored saved session");
                inner.session = Some(session);
                Event::Restored
            }
            None => {
                debug!("No saved session");
                Event::NotFound
            }
        };
        self.apply(&mut inner, event);
        inner.state
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        *self.tx.borrow()
    }

    /// Receiver for state changes (used by the access guard)
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.lock().session.clone()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.lock().session.as_ref().map(|s| s.user.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.access_token().to_string())
    }

    /// Install a session. Writes the store first, then flips to `Authenticated`.
    /// Logging in over an existing session replaces it without a visible transition.
    pub fn login(&self, credentials: CredentialBundle, user: UserProfile) -> Result<(), StoreError> {
        self.initialize();

        let session = Session::new(credentials, user);
        if !session.is_complete() {
            warn!(username = %session.user.username, "Login with incomplete credentials refused");
            return Err(StoreError::Incomplete);
        }

        let mut inner = self.inner.lock();
        self.store.save(&session)?;
        info!(username = %session.user.username, "Logged in");
        inner.session = Some(session);

        if inner.state == SessionState::Unauthenticated {
            self.apply(&mut inner, Event::LoggedIn);
        }
        Ok(())
    }

    /// Authenticate against the backend and install the resulting session
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<UserProfile, ApiError> {
        self.initialize();

        let grant = self.backend.login(username, password).await?;
        let user = grant.user.clone();
        self.login(grant.credentials, grant.user)?;
        Ok(user)
    }

    /// Create an account. When the backend logs the new user straight in,
    /// the session is installed and the profile returned.
    pub async fn register(&self, account: &NewAccount) -> Result<Option<UserProfile>, ApiError> {
        self.initialize();

        match self.backend.register(account).await? {
            Some(grant) => {
                let user = grant.user.clone();
                self.login(grant.credentials, grant.user)?;
                Ok(Some(user))
            }
            None => {
                info!(username = %account.username, "Account created without auto-login");
                Ok(None)
            }
        }
    }

    /// End the session. A no-op when nobody is logged in.
    ///
    /// The local session is cleared first; telling the server to invalidate
    /// the refresh token is best-effort and its failure is only logged.
    pub async fn logout(&self) -> Result<(), StoreError> {
        self.initialize();

        let credentials = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.session.clone() else {
                debug!("Logout requested without a session");
                return Ok(());
            };
            self.store.clear()?;
            inner.session = None;
            self.apply(&mut inner, Event::LoggedOut);
            info!(username = %session.user.username, "Logged out");
            session.credentials
        };

        if let Err(e) = self.backend.logout(&credentials).await {
            warn!(error = %e, "Server-side logout failed");
        }
        Ok(())
    }

    /// Drop the session after a failed refresh
    pub fn expire(&self, reason: &str) {
        self.initialize();

        let mut inner = self.inner.lock();
        if inner.session.is_none() && inner.state != SessionState::Authenticated {
            return;
        }
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear expired session from store");
        }
        inner.session = None;
        self.apply(&mut inner, Event::Expired);
        warn!(reason, "Session expired");
    }

    /// Swap in refreshed credentials, keeping the profile. Only applies when
    /// the current session is still the one holding `expected_refresh`;
    /// returns `None` otherwise.
    pub fn replace_credentials(
        &self,
        expected_refresh: &str,
        credentials: CredentialBundle,
    ) -> Result<Option<Session>, StoreError> {
        let mut inner = self.inner.lock();
        let updated = match inner.session {
            Some(ref current) if current.refresh_token() == expected_refresh => {
                current.with_credentials(credentials)
            }
            _ => return Ok(None),
        };

        self.store.save(&updated)?;
        debug!("Stored refreshed credentials");
        inner.session = Some(updated.clone());
        Ok(Some(updated))
    }

    /// Replace the stored profile, keeping credentials. `false` when logged out.
    pub fn update_profile(&self, user: UserProfile) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let updated = match inner.session {
            Some(ref current) => current.with_user(user),
            None => return Ok(false),
        };

        self.store.save(&updated)?;
        inner.session = Some(updated);
        Ok(true)
    }

    fn apply(&self, inner: &mut Inner, event: Event) {
        match next_state(inner.state, event) {
            Some(next) => {
                debug!(from = ?inner.state, to = ?next, ?event, "Session transition");
                inner.state = next;
                inner.epoch += 1;
                self.tx.send_replace(SessionSnapshot {
                    state: next,
                    epoch: inner.epoch,
                });
            }
            None => {
                warn!(from = ?inner.state, ?event, "Ignoring illegal session transition");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemorySessionStore;
    use crate::testing::{alice, bundle, FakeBackend};

    fn manager_with(store: Arc<MemorySessionStore>) -> (Arc<FakeBackend>, SessionManager) {
        let backend = Arc::new(FakeBackend::new());
        let manager = SessionManager::new(store, backend.clone());
        (backend, manager)
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert_eq!(next_state(Loading, Event::Restored), Some(Authenticated));
        assert_eq!(next_state(Loading, Event::NotFound), Some(Unauthenticated));
        assert_eq!(next_state(Unauthenticated, Event::LoggedIn), Some(Authenticated));
        assert_eq!(next_state(Authenticated, Event::LoggedOut), Some(Unauthenticated));
        assert_eq!(next_state(Authenticated, Event::Expired), Some(Unauthenticated));

        // Nothing leads back to Loading
        for event in [Event::Restored, Event::NotFound, Event::LoggedIn, Event::LoggedOut, Event::Expired] {
            assert_ne!(next_state(Authenticated, event), Some(Loading));
            assert_ne!(next_state(Unauthenticated, event), Some(Loading));
        }
        assert_eq!(next_state(Unauthenticated, Event::LoggedOut), None);
        assert_eq!(next_state(Loading, Event::LoggedIn), None);
    }

    #[test]
    fn test_initialize_empty_store() {
        let (_backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        let rx = manager.subscribe();
        assert_eq!(rx.borrow().state, SessionState::Loading);

        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
        assert_eq!(manager.snapshot().state, SessionState::Unauthenticated);
        assert_eq!(manager.snapshot().epoch, 1);

        // Second call does not reload or re-publish
        assert_eq!(manager.initialize(), SessionState::Unauthenticated);
        assert_eq!(manager.snapshot().epoch, 1);
    }

    #[test]
    fn test_initialize_restores_session() {
        let store = Arc::new(MemorySessionStore::with_session(Session::new(bundle(1), alice())));
        let (_backend, manager) = manager_with(store);

        assert_eq!(manager.initialize(), SessionState::Authenticated);
        assert_eq!(manager.current_user(), Some(alice()));
        assert_eq!(manager.access_token().as_deref(), Some("access-1"));
    }

    #[test]
    fn test_login_writes_store_then_flips_state() {
        let store = Arc::new(MemorySessionStore::new());
        let (_backend, manager) = manager_with(store.clone());

        manager.login(bundle(1), alice()).expect("login");
        assert!(manager.is_authenticated());

        let stored = store.load().expect("stored session");
        assert_eq!(stored.credentials, bundle(1));
        assert_eq!(stored.user, alice());
        // Loading -> Unauthenticated -> Authenticated
        assert_eq!(manager.snapshot().epoch, 2);
    }

    #[test]
    fn test_login_over_existing_session_is_silent() {
        let (_backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        manager.login(bundle(1), alice()).expect("login");
        let before = manager.snapshot();

        manager.login(bundle(2), alice()).expect("second login");
        assert_eq!(manager.snapshot(), before);
        assert_eq!(manager.access_token().as_deref(), Some("access-2"));
    }

    #[tokio::test]
    async fn test_logout_clears_and_notifies_server() {
        let store = Arc::new(MemorySessionStore::new());
        let (backend, manager) = manager_with(store.clone());
        manager.login(bundle(1), alice()).expect("login");

        manager.logout().await.expect("logout");
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store.load().is_none());
        assert!(manager.current_session().is_none());
        assert_eq!(backend.logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_logout_when_logged_out_is_noop() {
        let (backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        manager.logout().await.expect("logout");
        manager.logout().await.expect("logout again");

        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert_eq!(manager.snapshot().epoch, 1);
        assert_eq!(backend.logout_calls(), 0);
    }

    #[tokio::test]
    async fn test_logout_survives_server_failure() {
        let (backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        backend.fail_logout();
        manager.login(bundle(1), alice()).expect("login");

        manager.logout().await.expect("local logout still succeeds");
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_expire_clears_store() {
        let store = Arc::new(MemorySessionStore::with_session(Session::new(bundle(1), alice())));
        let (_backend, manager) = manager_with(store.clone());
        manager.initialize();

        manager.expire("refresh denied");
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store.load().is_none());

        // Expiring again is harmless and does not publish
        let epoch = manager.snapshot().epoch;
        manager.expire("refresh denied");
        assert_eq!(manager.snapshot().epoch, epoch);
    }

    #[test]
    fn test_replace_credentials_keeps_profile_and_state() {
        let store = Arc::new(MemorySessionStore::new());
        let (_backend, manager) = manager_with(store.clone());
        manager.login(bundle(1), alice()).expect("login");
        let before = manager.snapshot();

        let updated = manager
            .replace_credentials("refresh-1", bundle(2))
            .expect("save")
            .expect("session replaced");
        assert_eq!(updated.user, alice());
        assert_eq!(store.load().map(|s| s.credentials), Some(bundle(2)));
        assert_eq!(manager.snapshot(), before);

        // A refresh for a session that is no longer current is dropped
        assert!(manager.replace_credentials("refresh-1", bundle(3)).expect("ok").is_none());
        assert_eq!(manager.access_token().as_deref(), Some("access-2"));
    }

    #[test]
    fn test_update_profile() {
        let (_backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        manager.initialize();
        assert!(!manager.update_profile(alice()).expect("ok"));

        manager.login(bundle(1), alice()).expect("login");
        let mut renamed = alice();
        renamed.first_name = Some("Alicia".to_string());
        assert!(manager.update_profile(renamed.clone()).expect("ok"));
        assert_eq!(manager.current_user(), Some(renamed));
        assert_eq!(manager.access_token().as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_sign_in_uses_backend_grant() {
        let (backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        backend.set_login_grant(bundle(1), alice());

        let user = manager.sign_in("alice", "pw").await.expect("sign in");
        assert_eq!(user, alice());
        assert!(manager.is_authenticated());
        assert_eq!(manager.access_token().as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_register_with_auto_login() {
        let (backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        let account = NewAccount {
            username: "alice".to_string(),
            email: "alice@example.org".to_string(),
            password: "pw".to_string(),
            password_confirm: "pw".to_string(),
            first_name: "Alice".to_string(),
            last_name: String::new(),
            role: "citizen".to_string(),
            phone_number: None,
        };

        assert_eq!(manager.register(&account).await.expect("register"), None);
        assert_eq!(manager.state(), SessionState::Unauthenticated);

        backend.set_register_grant(bundle(1), alice());
        assert_eq!(manager.register(&account).await.expect("register"), Some(alice()));
        assert!(manager.is_authenticated());
    }

    #[test]
    fn test_login_refuses_incomplete_credentials() {
        let store = Arc::new(MemorySessionStore::new());
        let (_backend, manager) = manager_with(store.clone());

        let err = manager
            .login(CredentialBundle::new("access-1", ""), alice())
            .expect_err("missing refresh token");
        assert!(matches!(err, StoreError::Incomplete));
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store.load().is_none());

        // An existing session is left alone
        manager.login(bundle(1), alice()).expect("login");
        assert!(manager.login(CredentialBundle::new("", "refresh-2"), alice()).is_err());
        assert_eq!(manager.access_token().as_deref(), Some("access-1"));
        assert_eq!(store.load().map(|s| s.credentials), Some(bundle(1)));
    }

    #[tokio::test]
    async fn test_failed_sign_in_settles_out_of_loading() {
        let (_backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        assert_eq!(manager.state(), SessionState::Loading);

        let err = manager.sign_in("alice", "wrong").await.expect_err("no grant configured");
        assert!(matches!(err, ApiError::LoginRejected(_)));
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_loading_observed_once_and_first() {
        let (_backend, manager) = manager_with(Arc::new(MemorySessionStore::new()));
        let mut rx = manager.subscribe();
        let mut seen = vec![rx.borrow_and_update().state];

        manager.initialize();
        seen.push(rx.borrow_and_update().state);
        manager.login(bundle(1), alice()).expect("login");
        seen.push(rx.borrow_and_update().state);
        manager.expire("test");
        seen.push(rx.borrow_and_update().state);

        assert_eq!(seen.first(), Some(&SessionState::Loading));
        assert_eq!(seen.iter().filter(|s| **s == SessionState::Loading).count(), 1);
    }
}
