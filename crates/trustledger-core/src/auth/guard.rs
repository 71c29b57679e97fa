use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::{SessionSnapshot, SessionState};

/// Sends the user to the login entry point
pub trait Redirector: Send + Sync {
    fn redirect(&self, target: &str);
}

impl<F> Redirector for F
where
    F: Fn(&str) + Send + Sync,
{
    fn redirect(&self, target: &str) {
        self(target)
    }
}

/// What a protected screen shows for the current session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// Session store not consulted yet
    Loading,
    Content(T),
    /// Logged out; the redirect has been issued
    Redirecting,
}

/// Gate in front of protected content.
///
/// The redirect fires once per transition into `Unauthenticated`, keyed on
/// the snapshot epoch, so re-rendering a logged-out screen does not loop.
pub struct AccessGuard {
    rx: watch::Receiver<SessionSnapshot>,
    redirector: Arc<dyn Redirector>,
    entry: String,
    redirected_epoch: Option<u64>,
}

impl AccessGuard {
    pub fn new(
        rx: watch::Receiver<SessionSnapshot>,
        redirector: Arc<dyn Redirector>,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            rx,
            redirector,
            entry: entry.into(),
            redirected_epoch: None,
        }
    }

    pub fn render<T>(&mut self, content: impl FnOnce() -> T) -> Guarded<T> {
        let snapshot = *self.rx.borrow_and_update();
        match snapshot.state {
            SessionState::Loading => Guarded::Loading,
            SessionState::Authenticated => Guarded::Content(content()),
            SessionState::Unauthenticated => {
                if self.redirected_epoch != Some(snapshot.epoch) {
                    self.redirected_epoch = Some(snapshot.epoch);
                    info!(target = %self.entry, "Redirecting to login");
                    self.redirector.redirect(&self.entry);
                }
                Guarded::Redirecting
            }
        }
    }

    /// Render now and again on every state change until the session
    /// manager goes away.
    pub async fn watch<T>(&mut self, mut content: impl FnMut() -> T, mut show: impl FnMut(Guarded<T>)) {
        loop {
            show(self.render(&mut content));
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}
