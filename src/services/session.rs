//! Session lifecycle and per-user device tracking in the shared store.
//!
//! Layout:
//! - `session:{id}` encrypted [`Session`] JSON, TTL = remaining lifetime
//! - `user_sessions:{user_id}` set of session ids
//! - `device:{user_id}:{fingerprint}` [`DeviceSession`] JSON
//! - `user_devices:{user_id}` set of fingerprints

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cache::KeyValueStore;
use crate::config::SessionConfig;
use crate::crypto::cipher::Algorithm;
use crate::crypto::encryptor::{EncryptionResult, Encryptor};
use crate::crypto::tokens;
use crate::error::{AppError, Result};
use crate::models::session::{
    DeviceSession, IssuedSession, NewSession, Session, SessionMetadata, SessionValidation,
};
use crate::services::threat;

pub const REASON_NOT_FOUND: &str = "Session not found";
pub const REASON_INACTIVE: &str = "Session is inactive";
pub const REASON_EXPIRED: &str = "Session has expired";
pub const REASON_IDLE: &str = "Session timed out due to inactivity";
pub const REASON_IP_MISMATCH: &str = "IP address mismatch";
pub const REASON_UA_MISMATCH: &str = "User agent mismatch";

/// User agents sharing fewer tokens than this are treated as different clients.
pub const USER_AGENT_SIMILARITY_THRESHOLD: f64 = 0.8;

const SESSION_ALGORITHM: Algorithm = Algorithm::Aes256Gcm;

/// Source of the current time, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn session_key(id: &str) -> String {
    format!("session:{}", id)
}

fn user_sessions_key(user_id: &str) -> String {
    format!("user_sessions:{}", user_id)
}

fn device_key(user_id: &str, fingerprint: &str) -> String {
    format!("device:{}:{}", user_id, fingerprint)
}

fn user_devices_key(user_id: &str) -> String {
    format!("user_devices:{}", user_id)
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Token-overlap similarity: shared whitespace tokens over the larger token count.
pub fn user_agent_similarity(a: &str, b: &str) -> f64 {
    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    let max = left.len().max(right.len());
    if max == 0 {
        return 1.0;
    }
    left.intersection(&right).count() as f64 / max as f64
}

/// Owns session and device records in the shared store.
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    encryptor: Arc<Encryptor>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    token_key: Zeroizing<[u8; 32]>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        encryptor: Arc<Encryptor>,
        config: SessionConfig,
        token_key: [u8; 32],
    ) -> Self {
        Self::with_clock(store, encryptor, config, token_key, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        encryptor: Arc<Encryptor>,
        config: SessionConfig,
        token_key: [u8; 32],
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            encryptor,
            config,
            clock,
            token_key: Zeroizing::new(token_key),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolves a bearer token back to its session id.
    pub fn session_id_from_token(&self, token: &str) -> Option<String> {
        tokens::verify_bearer_token(&self.token_key, token)
    }

    /// Creates a session, evicting the least recently active ones so the user
    /// stays within `max_sessions_per_user`.
    pub async fn create_session(&self, data: NewSession) -> Result<IssuedSession> {
        let now = self.clock.now();
        if let Err(e) = self.enforce_session_limit(&data.user_id).await {
            tracing::warn!(user_id = %data.user_id, "⚠️ Session limit enforcement failed: {}", e);
        }

        let device = match data.device_fingerprint.as_deref() {
            Some(fingerprint) => {
                match self
                    .track_device(&data.user_id, fingerprint, &data.user_agent, now)
                    .await
                {
                    Ok(device) => Some(device),
                    Err(e) => {
                        tracing::warn!(user_id = %data.user_id, "⚠️ Device tracking failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let session = Session {
            id: tokens::generate_session_id(),
            user_id: data.user_id,
            device_id: device.as_ref().map(|d| d.device_id.clone()),
            device_fingerprint: data.device_fingerprint,
            ip_address: data.ip_address,
            user_agent: data.user_agent,
            created_at: now,
            last_activity: now,
            expires_at: now + span(self.config.session_timeout),
            active: true,
            metadata: SessionMetadata {
                login_method: data.login_method,
                risk_score_at_creation: data.risk_score,
                trusted_device: device.as_ref().is_some_and(|d| d.trusted),
                mfa_verified: data.mfa_verified,
            },
        };

        self.persist(&session, now).await?;
        let index = user_sessions_key(&session.user_id);
        self.store.set_add(&index, &session.id).await?;
        self.store.expire(&index, self.config.session_timeout).await?;

        tracing::info!(
            user_id = %session.user_id,
            session_id = %session.id,
            "✅ Session created"
        );

        let token = tokens::issue_bearer_token(&self.token_key, &session.id);
        Ok(IssuedSession { session, token })
    }

    async fn enforce_session_limit(&self, user_id: &str) -> Result<()> {
        let max = self.config.max_sessions_per_user.max(1);
        let mut existing = self.list_user_sessions(user_id).await?;
        if existing.len() < max {
            return Ok(());
        }

        existing.sort_by_key(|s| s.last_activity);
        let excess = existing.len() + 1 - max;
        for victim in existing.iter().take(excess) {
            match self.invalidate_session(&victim.id).await {
                Ok(_) => tracing::info!(
                    user_id = %user_id,
                    session_id = %victim.id,
                    "🧹 Evicted least recently active session"
                ),
                Err(e) => tracing::warn!(
                    user_id = %user_id,
                    session_id = %victim.id,
                    "⚠️ Session eviction failed: {}",
                    e
                ),
            }
        }
        Ok(())
    }

    /// Checks a session against expiry, idleness and the client's IP and user
    /// agent. A valid session has its activity bumped and is re-persisted.
    pub async fn validate_session(
        &self,
        session_id: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<SessionValidation> {
        let now = self.clock.now();
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(SessionValidation::invalid(REASON_NOT_FOUND));
        };

        if !session.active {
            return Ok(SessionValidation::invalid(REASON_INACTIVE));
        }

        if now > session.expires_at {
            self.discard(&session).await;
            return Ok(SessionValidation::invalid(REASON_EXPIRED));
        }

        if now - session.last_activity > span(self.config.inactivity_timeout) {
            self.discard(&session).await;
            return Ok(SessionValidation::invalid(REASON_IDLE));
        }

        let mut mismatches = Vec::new();
        if let Some(ip) = ip_address {
            if ip != session.ip_address {
                mismatches.push(REASON_IP_MISMATCH.to_string());
            }
        }
        if let Some(ua) = user_agent {
            if user_agent_similarity(ua, &session.user_agent) < USER_AGENT_SIMILARITY_THRESHOLD {
                mismatches.push(REASON_UA_MISMATCH.to_string());
            }
        }

        if !mismatches.is_empty() {
            if self.config.enable_suspicious_activity_detection {
                tracing::warn!(
                    user_id = %session.user_id,
                    session_id = %session.id,
                    reasons = ?mismatches,
                    "🚨 Suspicious session activity, invalidating"
                );
                self.discard(&session).await;
                return Ok(SessionValidation {
                    reasons: mismatches,
                    ..SessionValidation::default()
                });
            }
            tracing::warn!(
                user_id = %session.user_id,
                session_id = %session.id,
                reasons = ?mismatches,
                "⚠️ Session client changed"
            );
        }

        session.last_activity = now;
        if !self.repersist(&session, now).await? {
            return Ok(SessionValidation::invalid(REASON_NOT_FOUND));
        }

        let lifetime = (session.expires_at - session.created_at).num_milliseconds().max(1);
        let age = (now - session.created_at).num_milliseconds();
        let should_extend =
            age * 100 > lifetime * i64::from(self.config.extension_threshold_percent);

        Ok(SessionValidation {
            valid: true,
            session: Some(session),
            reasons: mismatches,
            should_extend,
        })
    }

    /// Resets the expiry to `now + session_timeout`. Returns `false` if the
    /// session no longer exists.
    pub async fn extend_session(&self, session_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(false);
        };
        if !session.active || now > session.expires_at {
            return Ok(false);
        }

        session.expires_at = now + span(self.config.session_timeout);
        if !self.repersist(&session, now).await? {
            return Ok(false);
        }
        self.store
            .expire(&user_sessions_key(&session.user_id), self.config.session_timeout)
            .await?;

        tracing::debug!(session_id = %session_id, "🔄 Session extended");
        Ok(true)
    }

    /// Removes the session record and its index membership.
    pub async fn invalidate_session(&self, session_id: &str) -> Result<bool> {
        let session = match self.load(session_id).await {
            Ok(session) => session,
            Err(AppError::Decryption(_)) => None,
            Err(e) => return Err(e),
        };
        self.store.del(&session_key(session_id)).await?;

        let Some(session) = session else {
            return Ok(false);
        };
        self.store
            .set_remove(&user_sessions_key(&session.user_id), session_id)
            .await?;

        tracing::info!(
            user_id = %session.user_id,
            session_id = %session_id,
            "🔒 Session invalidated"
        );
        Ok(true)
    }

    /// Logs the user out everywhere except `exclude`. Ids left in the index
    /// without a record are treated as already invalidated.
    pub async fn invalidate_all_user_sessions(
        &self,
        user_id: &str,
        exclude: Option<&str>,
    ) -> Result<usize> {
        let index = user_sessions_key(user_id);
        let mut removed = 0;
        for id in self.store.set_members(&index).await? {
            if exclude == Some(id.as_str()) {
                continue;
            }
            self.store.del(&session_key(&id)).await?;
            self.store.set_remove(&index, &id).await?;
            removed += 1;
        }

        tracing::info!(user_id = %user_id, removed, "🔒 All user sessions invalidated");
        Ok(removed)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.load(session_id).await
    }

    /// Live sessions for the user, most recently active first. Index entries
    /// whose record is gone are pruned.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let index = user_sessions_key(user_id);
        let mut sessions = Vec::new();
        for id in self.store.set_members(&index).await? {
            match self.load(&id).await {
                Ok(Some(session)) if session.active => sessions.push(session),
                Ok(_) => self.store.set_remove(&index, &id).await?,
                Err(AppError::Decryption(e)) => {
                    tracing::error!(session_id = %id, "❌ Unreadable session record: {}", e);
                    self.store.set_remove(&index, &id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    pub async fn list_user_devices(&self, user_id: &str) -> Result<Vec<DeviceSession>> {
        let mut devices = Vec::new();
        for fingerprint in self.store.set_members(&user_devices_key(user_id)).await? {
            if let Some(device) = self.load_device(user_id, &fingerprint).await? {
                devices.push(device);
            }
        }
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(devices)
    }

    pub async fn get_device(&self, user_id: &str, fingerprint: &str) -> Result<Option<DeviceSession>> {
        self.load_device(user_id, fingerprint).await
    }

    pub async fn set_device_trust(
        &self,
        user_id: &str,
        fingerprint: &str,
        trusted: bool,
    ) -> Result<DeviceSession> {
        let mut device = self
            .load_device(user_id, fingerprint)
            .await?
            .ok_or(AppError::NotFound)?;
        device.trusted = trusted;
        self.save_device(user_id, &device).await?;

        tracing::info!(user_id = %user_id, fingerprint = %fingerprint, trusted, "🔐 Device trust updated");
        Ok(device)
    }

    /// Flags the session as having passed MFA.
    pub async fn mark_mfa_verified(&self, session_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(false);
        };
        if !session.active || now > session.expires_at {
            return Ok(false);
        }
        session.metadata.mfa_verified = true;
        self.repersist(&session, now).await
    }

    pub async fn is_mfa_verified(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .load(session_id)
            .await?
            .is_some_and(|s| s.active && s.metadata.mfa_verified))
    }

    async fn track_device(
        &self,
        user_id: &str,
        fingerprint: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceSession> {
        let device = match self.load_device(user_id, fingerprint).await? {
            Some(mut device) => {
                device.last_seen = now;
                device.session_count += 1;
                device.active = true;
                device
            }
            None => DeviceSession {
                device_id: Uuid::new_v4().to_string(),
                device_name: threat::device_name(user_agent),
                fingerprint: fingerprint.to_string(),
                trusted: false,
                first_seen: now,
                last_seen: now,
                session_count: 1,
                active: true,
            },
        };

        self.save_device(user_id, &device).await?;
        let index = user_devices_key(user_id);
        self.store.set_add(&index, fingerprint).await?;
        self.store.expire(&index, self.config.device_ttl).await?;
        Ok(device)
    }

    async fn load_device(&self, user_id: &str, fingerprint: &str) -> Result<Option<DeviceSession>> {
        let Some(raw) = self.store.get(&device_key(user_id, fingerprint)).await? else {
            return Ok(None);
        };
        sonic_rs::from_str(&raw)
            .map(Some)
            .map_err(|e| AppError::Store(format!("Invalid device record: {}", e)))
    }

    async fn save_device(&self, user_id: &str, device: &DeviceSession) -> Result<()> {
        let json = sonic_rs::to_string(device)
            .map_err(|e| AppError::Store(format!("Device serialization failed: {}", e)))?;
        self.store
            .set_ex(
                &device_key(user_id, &device.fingerprint),
                &json,
                self.config.device_ttl,
            )
            .await
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        if !tokens::is_session_id(session_id) {
            return Ok(None);
        }
        let Some(raw) = self.store.get(&session_key(session_id)).await? else {
            return Ok(None);
        };

        let sealed: EncryptionResult = sonic_rs::from_str(&raw)
            .map_err(|e| AppError::Decryption(format!("Invalid session envelope: {}", e)))?;
        let plain = self.encryptor.decrypt(&sealed, None, SESSION_ALGORITHM)?;
        sonic_rs::from_slice(&plain)
            .map(Some)
            .map_err(|e| AppError::Decryption(format!("Invalid session payload: {}", e)))
    }

    fn seal(&self, session: &Session, now: DateTime<Utc>) -> Result<(String, Duration)> {
        let json = sonic_rs::to_string(session)
            .map_err(|e| AppError::Encryption(format!("Session serialization failed: {}", e)))?;
        let sealed = self.encryptor.encrypt(json, None, SESSION_ALGORITHM)?;
        let envelope = sonic_rs::to_string(&sealed)
            .map_err(|e| AppError::Encryption(format!("Envelope serialization failed: {}", e)))?;

        let ttl = (session.expires_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        Ok((envelope, ttl))
    }

    /// Writes a freshly created session.
    async fn persist(&self, session: &Session, now: DateTime<Utc>) -> Result<()> {
        let (envelope, ttl) = self.seal(session, now)?;
        self.store.set_ex(&session_key(&session.id), &envelope, ttl).await
    }

    /// Rewrites an existing session. Returns `false` if the record vanished
    /// since it was loaded; a removed session is never written back.
    async fn repersist(&self, session: &Session, now: DateTime<Utc>) -> Result<bool> {
        let (envelope, ttl) = self.seal(session, now)?;
        let written = self
            .store
            .set_ex_existing(&session_key(&session.id), &envelope, ttl)
            .await?;
        if !written {
            tracing::warn!(session_id = %session.id, "⚠️ Session removed concurrently, not rewritten");
        }
        Ok(written)
    }

    /// Best-effort removal used when validation finds a terminal session.
    async fn discard(&self, session: &Session) {
        if let Err(e) = self.invalidate_session(&session.id).await {
            tracing::warn!(session_id = %session.id, "⚠️ Failed to discard session: {}", e);
        }
    }
}
