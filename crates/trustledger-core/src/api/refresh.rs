//! Single-flight token refresh.
//!
//! Any number of requests may discover at the same time that the access
//! token has expired. The coordinator turns all of those signals into one
//! refresh call: the first caller creates a pending refresh in a guarded
//! slot, later callers join it, and every waiter receives the same bundle or
//! the same error. The slot is cleared when the refresh settles so the next
//! expiry starts a fresh episode.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::refresh_with_timeout;
use super::{AuthBackend, RefreshError};
use crate::auth::{CredentialBundle, SessionManager};

type RefreshFuture = Shared<BoxFuture<'static, Result<CredentialBundle, RefreshError>>>;

struct PendingRefresh {
    episode: u64,
    result: RefreshFuture,
}

#[derive(Default)]
struct RefreshSlot {
    pending: Option<PendingRefresh>,
    episodes: u64,
}

struct Inner {
    manager: Arc<SessionManager>,
    backend: Arc<dyn AuthBackend>,
    timeout: Duration,
    slot: Mutex<RefreshSlot>,
}

/// Cheap to clone; clones share the same pending-refresh slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(manager: Arc<SessionManager>, backend: Arc<dyn AuthBackend>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                backend,
                timeout,
                slot: Mutex::new(RefreshSlot::default()),
            }),
        }
    }

    /// Get fresh credentials, starting a refresh or joining the one in flight
    pub async fn refresh(&self) -> Result<CredentialBundle, RefreshError> {
        self.refresh_stale(None).await
    }

    /// Like [`refresh`](Self::refresh), for a caller whose request was
    /// rejected while carrying `used_token`. If the session already holds a
    /// different access token, a refresh finished after that request left;
    /// its bundle is returned without another network call.
    pub async fn refresh_stale(&self, used_token: Option<&str>) -> Result<CredentialBundle, RefreshError> {
        let pending = {
            let mut slot = self.inner.slot.lock();
            let in_flight = slot
                .pending
                .as_ref()
                .map(|p| (p.episode, p.result.clone()));
            match in_flight {
                Some((episode, result)) => {
                    debug!(episode, "Joining in-flight refresh");
                    result
                }
                None => {
                    if let Some(current) = self.newer_credentials(used_token) {
                        debug!("Credentials already renewed, skipping refresh");
                        return Ok(current);
                    }
                    self.start(&mut slot)
                }
            }
        };
        pending.await
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.slot.lock().pending.is_some()
    }

    fn newer_credentials(&self, used_token: Option<&str>) -> Option<CredentialBundle> {
        let used = used_token?;
        let session = self.inner.manager.current_session()?;
        (session.access_token() != used).then(|| session.credentials.clone())
    }

    /// Create the pending refresh. Runs with the slot locked, so the spawned
    /// task cannot clear the slot before it has been filled.
    fn start(&self, slot: &mut RefreshSlot) -> RefreshFuture {
        slot.episodes += 1;
        let episode = slot.episodes;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.run(episode).await;
            inner.finish(episode);
            result
        });

        let inner = Arc::clone(&self.inner);
        let result = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    inner.finish(episode);
                    let err = RefreshError::Denied(format!("refresh task failed: {}", e));
                    inner.manager.expire(&err.to_string());
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();

        slot.pending = Some(PendingRefresh {
            episode,
            result: result.clone(),
        });
        result
    }
}

impl Inner {
    /// The one network call of an episode, plus its effect on the session
    async fn run(&self, episode: u64) -> Result<CredentialBundle, RefreshError> {
        self.manager.initialize();

        let refresh_token = match self.manager.current_session() {
            Some(session) if !session.refresh_token().is_empty() => session.refresh_token().to_string(),
            _ => {
                debug!(episode, "No refresh token available");
                self.manager.expire("no refresh token");
                return Err(RefreshError::Unavailable);
            }
        };

        info!(episode, "Refreshing access token");
        match refresh_with_timeout(self.backend.as_ref(), &refresh_token, self.timeout).await {
            Ok(tokens) => {
                let bundle = tokens.into_bundle(&refresh_token);
                match self.manager.replace_credentials(&refresh_token, bundle.clone()) {
                    Ok(Some(_)) => {
                        info!(episode, "Access token refreshed");
                        Ok(bundle)
                    }
                    Ok(None) => match self.manager.current_session() {
                        // Replaced by a new login: its credentials are the fresh ones
                        Some(current) => {
                            debug!(episode, "Session replaced during refresh, using the new one");
                            Ok(current.credentials)
                        }
                        None => {
                            debug!(episode, "Session ended during refresh, discarding result");
                            Err(RefreshError::Unavailable)
                        }
                    },
                    Err(e) => {
                        let err = RefreshError::Denied(format!("could not store refreshed session: {}", e));
                        self.manager.expire(&err.to_string());
                        Err(err)
                    }
                }
            }
            Err(err) => {
                warn!(episode, error = %err, "Token refresh failed");
                self.manager.expire(&err.to_string());
                Err(err)
            }
        }
    }

    /// Empty the slot if it still holds this episode
    fn finish(&self, episode: u64) {
        let mut slot = self.slot.lock();
        if slot.pending.as_ref().map(|p| p.episode) == Some(episode) {
            slot.pending = None;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
