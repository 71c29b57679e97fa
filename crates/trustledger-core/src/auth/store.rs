use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use super::Session;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Suffix for the scratch file a save goes through before the rename
const TEMP_SUFFIX: &str = "tmp";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keychain(String),

    /// Empty access or refresh token. Such a record would load as absent.
    #[error("Refusing to store a session without both tokens")]
    Incomplete,
}

/// Durable holder for the one process-wide [`Session`].
///
/// `load` never fails: a missing, corrupt or partial record is "logged out".
/// Only the session manager writes through `save`/`clear`.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Option<Session>;

    fn save(&self, session: &Session) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

/// Decode a stored record, rejecting anything that is not a whole session.
pub(crate) fn decode_record(contents: &str, origin: &str) -> Option<Session> {
    match serde_json::from_str::<Session>(contents) {
        Ok(session) if session.is_complete() => Some(session),
        Ok(_) => {
            warn!(origin, "Ignoring partial session record");
            None
        }
        Err(e) => {
            warn!(origin, error = %e, "Ignoring unreadable session record");
            None
        }
    }
}

// ============================================================================
// File store
// ============================================================================

/// JSON record on disk. Saves go through a temp file and a rename so a
/// reader never sees half a record.
pub struct FileSessionStore {
    cache_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.session_path().with_extension(TEMP_SUFFIX)
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<Session> {
        let path = self.session_path();
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => decode_record(&contents, "file"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read session file");
                None
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| Self::io_error(&self.cache_dir, e))?;

        let contents = serde_json::to_string_pretty(session)?;
        let temp = self.temp_path();
        std::fs::write(&temp, contents).map_err(|e| Self::io_error(&temp, e))?;

        let path = self.session_path();
        std::fs::rename(&temp, &path).map_err(|e| Self::io_error(&path, e))?;
        debug!(path = %path.display(), "Session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| Self::io_error(&path, e))?;
            debug!(path = %path.display(), "Session file removed");
        }
        Ok(())
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// In-process store. Nothing survives a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            record: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<Session> {
        self.record
            .lock()
            .as_ref()
            .filter(|s| s.is_complete())
            .cloned()
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        *self.record.lock() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.record.lock() = None;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
