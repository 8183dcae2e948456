use std::collections::HashMap;

use argon2::{
    Argon2, ParamsBuilder,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::{AppError, Result};
use crate::models::user::AuthenticatedUser;

/// The memory cost for Argon2 in MB.
const ARGON2_MEMORY_MB: u32 = 19;
/// The number of iterations for Argon2.
const ARGON2_ITERATIONS: u32 = 3;
/// The parallelism factor for Argon2.
const ARGON2_PARALLELISM: u32 = 4;

/// A user as known to the directory.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub roles: Vec<String>,
    pub premium: bool,
    password_hash: String,
    mfa_code_hash: Option<String>,
}

impl UserRecord {
    pub fn mfa_enabled(&self) -> bool {
        self.mfa_code_hash.is_some()
    }

    /// The request identity for this user on `session_id`.
    pub fn identity(&self, session_id: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            email_verified: self.email_verified,
            mfa_enabled: self.mfa_enabled(),
            roles: self.roles.clone(),
            premium: self.premium,
            session_id: session_id.to_string(),
        }
    }
}

/// Input for [`MemoryUserDirectory::insert`].
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub id: Option<String>,
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub roles: Vec<String>,
    pub premium: bool,
    /// Enables MFA with this verification code.
    pub mfa_code: Option<String>,
}

/// Turns credentials and ids into identities.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>>;

    /// Returns the user when the password matches. Unknown users and wrong
    /// passwords are indistinguishable to the caller.
    async fn verify_credentials(&self, username: &str, password: &str)
    -> Result<Option<UserRecord>>;

    async fn verify_mfa_code(&self, user_id: &str, code: &str) -> Result<bool>;
}

/// Hashes a password using Argon2id.
fn hash_password(password: &str) -> Result<String> {
    let mut password_bytes = password.as_bytes().to_vec();

    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| AppError::Encryption(format!("Salt encoding error: {}", e)))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        ParamsBuilder::new()
            .m_cost(ARGON2_MEMORY_MB * 1024)
            .t_cost(ARGON2_ITERATIONS)
            .p_cost(ARGON2_PARALLELISM)
            .build()
            .map_err(|e| AppError::Encryption(format!("Argon2 params: {}", e)))?,
    );

    let password_hash = argon2
        .hash_password(&password_bytes, &salt)
        .map_err(|e| AppError::Encryption(format!("Argon2 hash error: {}", e)))?
        .to_string();

    password_bytes.zeroize();
    Ok(password_hash)
}

/// Verifies a password against an encoded Argon2 hash.
fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let mut password_bytes = password.as_bytes().to_vec();
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Encryption(format!("Hash parse error: {}", e)))?;
    let result = Argon2::default()
        .verify_password(&password_bytes, &parsed_hash)
        .is_ok();

    password_bytes.zeroize();
    Ok(result)
}

/// In-process directory keyed by user id.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
    dummy_hash: std::sync::OnceLock<String>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes the password (and MFA code) and stores the user.
    pub async fn insert(&self, user: NewUser) -> Result<UserRecord> {
        let username = user.username.trim().to_ascii_lowercase();
        {
            let users = self.users.read().await;
            if users.values().any(|u| u.username == username) {
                return Err(AppError::Validation("Username already exists".to_string()));
            }
        }

        let password_hash = hash_blocking(user.password).await?;
        let mfa_code_hash = match user.mfa_code {
            Some(code) => Some(hash_blocking(code).await?),
            None => None,
        };

        let record = UserRecord {
            id: user.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            username,
            email: user.email,
            email_verified: user.email_verified,
            roles: if user.roles.is_empty() {
                vec!["user".to_string()]
            } else {
                user.roles
            },
            premium: user.premium,
            password_hash,
            mfa_code_hash,
        };

        self.users
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        tracing::info!(user_id = %record.id, username = %record.username, "✅ User registered");
        Ok(record)
    }

    /// Equalizes timing for unknown usernames by verifying against a throwaway hash.
    async fn burn_verification(&self, password: &str) {
        let hash = match self.dummy_hash.get() {
            Some(hash) => hash.clone(),
            None => match hash_blocking("not-a-real-password".to_string()).await {
                Ok(hash) => self.dummy_hash.get_or_init(|| hash).clone(),
                Err(_) => return,
            },
        };
        let _ = verify_blocking(password.to_string(), hash).await;
    }
}

async fn hash_blocking(secret: String) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let mut secret = secret;
        let hashed = hash_password(&secret);
        secret.zeroize();
        hashed
    })
    .await
    .map_err(|e| AppError::Internal(format!("Hashing task failed: {}", e)))?
}

async fn verify_blocking(secret: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || {
        let mut secret = secret;
        let verified = verify_password(&secret, &hash);
        secret.zeroize();
        verified
    })
    .await
    .map_err(|e| AppError::Internal(format!("Verification task failed: {}", e)))?
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>> {
        let username = username.trim().to_ascii_lowercase();
        let found = self
            .users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned();

        let Some(user) = found else {
            self.burn_verification(password).await;
            tracing::warn!(username = %username, "❌ Login attempt for unknown user");
            return Ok(None);
        };

        if verify_blocking(password.to_string(), user.password_hash.clone()).await? {
            Ok(Some(user))
        } else {
            tracing::warn!(user_id = %user.id, "❌ Invalid password");
            Ok(None)
        }
    }

    async fn verify_mfa_code(&self, user_id: &str, code: &str) -> Result<bool> {
        let Some(hash) = self
            .users
            .read()
            .await
            .get(user_id)
            .and_then(|u| u.mfa_code_hash.clone())
        else {
            return Ok(false);
        };
        verify_blocking(code.to_string(), hash).await
    }
}
