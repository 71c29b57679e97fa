use keyring::Entry;
use tracing::{debug, warn};

use super::store::{decode_record, SessionStore, StoreError};
use super::Session;

/// Keychain service used when the config names none
pub const DEFAULT_SERVICE: &str = "trustledger";

/// Keychain account the session record is filed under
const SESSION_ACCOUNT: &str = "session";

/// Session record kept as a single secret in the OS keychain.
///
/// The keychain replaces the secret in one call, so the record is always
/// written whole. One entry is opened up front and reused for every call.
pub struct KeyringSessionStore {
    service: String,
    entry: Entry,
}

impl KeyringSessionStore {
    pub fn new(service: &str) -> Result<Self, StoreError> {
        let entry = Entry::new(service, SESSION_ACCOUNT)
            .map_err(|e| StoreError::Keychain(format!("Failed to create keyring entry: {}", e)))?;
        Ok(Self {
            service: service.to_string(),
            entry,
        })
    }

    #[cfg(test)]
    fn with_entry(service: &str, entry: Entry) -> Self {
        Self {
            service: service.to_string(),
            entry,
        }
    }
}

impl SessionStore for KeyringSessionStore {
    fn load(&self) -> Option<Session> {
        match self.entry.get_password() {
            Ok(contents) => decode_record(&contents, "keychain"),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read session from keychain");
                None
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let contents = serde_json::to_string(session)?;
        self.entry
            .set_password(&contents)
            .map_err(|e| StoreError::Keychain(format!("Failed to store session in keychain: {}", e)))?;
        debug!(service = %self.service, "Session saved to keychain");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keychain(format!(
                "Failed to delete session from keychain: {}",
                e
            ))),
        }
    }
}
