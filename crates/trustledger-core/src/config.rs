//! Client configuration management.
//!
//! Holds the backend location, endpoint paths, timeouts, where the session
//! is kept, and the last used username.
//!
//! Configuration is stored at `~/.config/trustledger/config.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::keyring_store::DEFAULT_SERVICE;
use crate::auth::{FileSessionStore, KeyringSessionStore, MemorySessionStore, SessionStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "trustledger";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `base_url`
pub const ENV_API_URL: &str = "TRUSTLEDGER_API_URL";

/// Environment variable overriding `session_backend`
pub const ENV_SESSION_BACKEND: &str = "TRUSTLEDGER_SESSION_BACKEND";

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a token refresh call. Waiters on a refresh that never
/// answers are released with `RefreshDenied` after this long.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 10;

const DEFAULT_LOGIN_ENTRY: &str = "/login";

/// Backend endpoint paths, relative to `base_url`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
    pub logout: String,
    pub profile: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login/".to_string(),
            register: "/auth/register/".to_string(),
            refresh: "/token/refresh/".to_string(),
            logout: "/auth/logout/".to_string(),
            profile: "/auth/profile/".to_string(),
        }
    }
}

/// Where the session record lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for SessionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SessionBackend::File),
            "keyring" | "keychain" => Ok(SessionBackend::Keyring),
            "memory" => Ok(SessionBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown session backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub endpoints: Endpoints,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    /// Where the access guard sends users once the session is gone
    pub login_entry: String,
    pub session_backend: SessionBackend,
    /// Keychain service name for the keyring backend. Give each backend
    /// deployment its own to keep their sessions apart.
    pub keyring_service: String,
    pub cache_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub last_username: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoints: Endpoints::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            login_entry: DEFAULT_LOGIN_ENTRY.to_string(),
            session_backend: SessionBackend::default(),
            keyring_service: DEFAULT_SERVICE.to_string(),
            cache_dir: None,
            log_dir: None,
            last_username: None,
        }
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `TRUSTLEDGER_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            if !url.trim().is_empty() {
                self.base_url = url.trim().to_string();
            }
        }
        if let Ok(backend) = std::env::var(ENV_SESSION_BACKEND) {
            self.session_backend = backend.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    /// Join an endpoint path onto the base URL
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Build the session store this config asks for
    pub fn session_store(&self) -> Result<Arc<dyn SessionStore>> {
        let store: Arc<dyn SessionStore> = match self.session_backend {
            SessionBackend::File => Arc::new(FileSessionStore::new(self.cache_dir()?)),
            SessionBackend::Keyring => Arc::new(KeyringSessionStore::new(&self.keyring_service)?),
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
        };
        Ok(store)
    }
}
