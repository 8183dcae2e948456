use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethod {
    #[default]
    Password,
    Mfa,
    Sso,
    Token,
}

/// Security metadata captured when the session was created.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub login_method: LoginMethod,
    pub risk_score_at_creation: u32,
    pub trusted_device: bool,
    pub mfa_verified: bool,
}

/// One authenticated client session.
///
/// Persisted only in encrypted form under `session:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub device_fingerprint: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub metadata: SessionMetadata,
}

/// Input for `SessionManager::create_session`.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub user_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub device_fingerprint: Option<String>,
    pub login_method: LoginMethod,
    pub risk_score: u32,
    pub mfa_verified: bool,
}

/// A created session together with the bearer token bound to it.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub token: String,
}

/// Result of `SessionManager::validate_session`.
#[derive(Debug, Clone, Default)]
pub struct SessionValidation {
    pub valid: bool,
    pub session: Option<Session>,
    pub reasons: Vec<String>,
    /// The session has used enough of its lifetime that extending it is advisable.
    pub should_extend: bool,
}

impl SessionValidation {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            reasons: vec![reason.into()],
            ..Self::default()
        }
    }
}

/// One (user, fingerprint) pair the user has logged in from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub device_id: String,
    pub device_name: String,
    pub fingerprint: String,
    pub trusted: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub session_count: u64,
    pub active: bool,
}

/// Session as shown to its owner. Never carries the token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub device_fingerprint: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub current: bool,
}

impl SessionSummary {
    pub fn from_session(session: &Session, current_id: Option<&str>) -> Self {
        Self {
            id: session.id.clone(),
            device_fingerprint: session.device_fingerprint.clone(),
            ip_address: session.ip_address.clone(),
            user_agent: session.user_agent.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            expires_at: session.expires_at,
            current: current_id == Some(session.id.as_str()),
        }
    }
}
