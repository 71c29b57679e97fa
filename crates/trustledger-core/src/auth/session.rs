use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access + refresh token pair. Both values are opaque and never decoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialBundle {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Both tokens present. An empty token means the record was only half written.
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }
}

// Keep tokens out of logs and panic messages.
impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Account role as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Citizen,
    DepartmentHead,
    Auditor,
    Committee,
    Admin,
    #[serde(other)]
    Other,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Citizen => "Citizen",
            Role::DepartmentHead => "Department Head",
            Role::Auditor => "Auditor",
            Role::Committee => "Committee Member",
            Role::Admin => "Administrator",
            Role::Other => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl UserProfile {
    /// "First Last" when the backend knows a name, otherwise the username.
    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if parts.is_empty() {
            self.username.clone()
        } else {
            parts.join(" ")
        }
    }
}

/// A logged-in session: credentials plus the identity they belong to.
///
/// This is the unit of persistence. A session is either stored whole or not
/// at all; see [`Session::is_complete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub credentials: CredentialBundle,
    pub user: UserProfile,
    pub saved_at: DateTime<Utc>,
}

impl Session {
    pub fn new(credentials: CredentialBundle, user: UserProfile) -> Self {
        Self {
            credentials,
            user,
            saved_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.credentials.is_complete() && !self.user.username.is_empty()
    }

    /// Copy of this session carrying a new credential bundle. Profile unchanged.
    pub fn with_credentials(&self, credentials: CredentialBundle) -> Self {
        Self {
            credentials,
            user: self.user.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Copy of this session carrying a new profile. Credentials unchanged.
    pub fn with_user(&self, user: UserProfile) -> Self {
        Self {
            credentials: self.credentials.clone(),
            user,
            saved_at: Utc::now(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.credentials.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.credentials.refresh_token
    }

    /// Minutes since this record was last written (for display)
    pub fn minutes_since_saved(&self) -> i64 {
        (Utc::now() - self.saved_at).num_minutes().max(0)
    }
}

// ============================================================================
// Tests
// ============================================================================
