//! Encryption-at-rest service.
//!
//! Wraps the primitive ciphers with a long-lived master key, caller supplied
//! keys (stretched with Argon2id), PBKDF2 salted hashing and field-level
//! encryption of JSON records.

use std::collections::HashMap;

use argon2::Argon2;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypto::cipher::{self, Algorithm, KEY_SIZE, SecureKey};
use crate::error::{AppError, Result};

/// PBKDF2 iteration count for salted hashes.
pub const HASH_ITERATIONS: u32 = 100_000;
/// Output length of salted hashes in bytes.
pub const HASH_LENGTH: usize = 32;
const HASH_SALT_LENGTH: usize = 32;
const KEY_SALT_LENGTH: usize = 16;

/// Serialized output of [`Encryptor::encrypt`]. Binary fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionResult {
    pub encrypted: String,
    pub iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,
    /// Present when the key was derived from a caller supplied secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// A PBKDF2 hash and the salt it was derived with, both hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedHash {
    pub hash: String,
    pub salt: String,
}

/// How a named field is treated by object encryption and log masking.
#[derive(Debug, Clone, Copy)]
pub struct FieldPolicy {
    pub algorithm: Option<Algorithm>,
    pub mask: bool,
}

static FIELD_POLICIES: Lazy<HashMap<&'static str, FieldPolicy>> = Lazy::new(|| {
    use Algorithm::*;
    let strong = |mask| FieldPolicy { algorithm: Some(Aes256Gcm), mask };
    HashMap::from([
        ("password", strong(true)),
        ("ssn", strong(true)),
        ("apikey", strong(true)),
        ("token", strong(true)),
        ("accesstoken", strong(true)),
        ("refreshtoken", strong(true)),
        ("secret", strong(true)),
        ("creditcard", strong(true)),
        ("cardnumber", strong(true)),
        ("mfasecret", FieldPolicy { algorithm: Some(ChaCha20Poly1305), mask: true }),
        ("phone", FieldPolicy { algorithm: Some(ChaCha20Poly1305), mask: true }),
        ("phonenumber", FieldPolicy { algorithm: Some(ChaCha20Poly1305), mask: true }),
        ("address", FieldPolicy { algorithm: Some(Aes256Cbc), mask: true }),
        ("notes", FieldPolicy { algorithm: Some(Aes256Cbc), mask: false }),
        ("description", FieldPolicy { algorithm: Some(Aes256Cbc), mask: false }),
        ("bio", FieldPolicy { algorithm: Some(Aes256Cbc), mask: false }),
        ("email", FieldPolicy { algorithm: None, mask: true }),
    ])
});

/// Looks up the policy for a field, ignoring case and `_`/`-` separators.
pub fn field_policy(name: &str) -> Option<FieldPolicy> {
    let normalized: String = name
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    FIELD_POLICIES.get(normalized.as_str()).copied()
}

/// Authenticated encryption service holding the process master key.
pub struct Encryptor {
    master_key: SecureKey,
}

impl Encryptor {
    pub fn new(master_key: &[u8]) -> Result<Self> {
        Ok(Self {
            master_key: SecureKey::from_slice(master_key)?,
        })
    }

    /// Encrypts `plaintext`. With `key = None` the master key is used; otherwise
    /// a key is derived from `key` with a fresh salt carried in the result.
    pub fn encrypt(
        &self,
        plaintext: impl AsRef<[u8]>,
        key: Option<&str>,
        algorithm: Algorithm,
    ) -> Result<EncryptionResult> {
        let salt = key.map(|_| cipher::random_bytes(KEY_SALT_LENGTH));
        let derived = self.resolve_key(key, salt.as_deref())?;

        let sealed = cipher::encrypt(algorithm, &derived, plaintext.as_ref())?;

        Ok(EncryptionResult {
            encrypted: STANDARD.encode(&sealed.ciphertext),
            iv: STANDARD.encode(&sealed.iv),
            auth_tag: sealed.tag.map(|t| STANDARD.encode(t)),
            salt: salt.map(|s| STANDARD.encode(s)),
        })
    }

    /// Decrypts a result produced by [`Encryptor::encrypt`].
    pub fn decrypt(
        &self,
        result: &EncryptionResult,
        key: Option<&str>,
        algorithm: Algorithm,
    ) -> Result<Vec<u8>> {
        if algorithm.is_aead() && result.auth_tag.is_none() {
            return Err(AppError::Decryption(format!(
                "Missing authentication tag for {}",
                algorithm
            )));
        }

        let ciphertext = decode_field(&result.encrypted, "ciphertext")?;
        let iv = decode_field(&result.iv, "iv")?;
        let tag = result
            .auth_tag
            .as_deref()
            .map(|t| decode_field(t, "authTag"))
            .transpose()?;

        let salt = match (key, result.salt.as_deref()) {
            (Some(_), Some(s)) => Some(decode_field(s, "salt")?),
            (Some(_), None) => {
                return Err(AppError::Decryption(
                    "Salt is required to derive the decryption key".to_string(),
                ));
            }
            (None, _) => None,
        };
        let derived = self.resolve_key(key, salt.as_deref())?;

        cipher::decrypt(algorithm, &derived, &ciphertext, &iv, tag.as_deref())
    }

    /// Decrypts into a UTF-8 string.
    pub fn decrypt_to_string(
        &self,
        result: &EncryptionResult,
        key: Option<&str>,
        algorithm: Algorithm,
    ) -> Result<String> {
        let bytes = self.decrypt(result, key, algorithm)?;
        String::from_utf8(bytes)
            .map_err(|_| AppError::Decryption("Plaintext is not valid UTF-8".to_string()))
    }

    fn resolve_key(
        &self,
        key: Option<&str>,
        salt: Option<&[u8]>,
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        match (key, salt) {
            (None, _) => Ok(Zeroizing::new(*self.master_key.as_bytes())),
            (Some(secret), Some(salt)) => derive_key(secret, salt),
            (Some(_), None) => Err(AppError::Encryption("Missing key salt".to_string())),
        }
    }

    /// Derives a PBKDF2-HMAC-SHA512 hash of `data`. A salt is generated when none is given.
    pub fn hash_with_salt(&self, data: &str, salt: Option<&str>) -> Result<SaltedHash> {
        let salt_bytes = match salt {
            Some(hex_salt) => hex::decode(hex_salt)
                .map_err(|_| AppError::Validation("Salt must be hex encoded".to_string()))?,
            None => cipher::random_bytes(HASH_SALT_LENGTH),
        };

        let hash = pbkdf2_sha512(data.as_bytes(), &salt_bytes);

        Ok(SaltedHash {
            hash: hex::encode(&hash[..]),
            salt: hex::encode(&salt_bytes),
        })
    }

    /// Recomputes the hash of `data` and compares it in constant time.
    pub fn verify_hash(&self, data: &str, hash: &str, salt: &str) -> bool {
        let (Ok(expected), Ok(salt_bytes)) = (hex::decode(hash), hex::decode(salt)) else {
            return false;
        };
        let computed = pbkdf2_sha512(data.as_bytes(), &salt_bytes);
        expected.len() == HASH_LENGTH && bool::from(computed[..].ct_eq(&expected[..]))
    }

    /// Encrypts every string field that has an algorithm in the field table.
    /// Nested objects and arrays are walked.
    pub fn encrypt_object(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (name, field) in map {
                    let policy = field_policy(name).and_then(|p| p.algorithm);
                    let encrypted = match (policy, field) {
                        (Some(algorithm), Value::String(plain)) => {
                            let result = self.encrypt(plain, None, algorithm)?;
                            serde_json::to_value(result)
                                .map_err(|e| AppError::Encryption(e.to_string()))?
                        }
                        _ => self.encrypt_object(field)?,
                    };
                    out.insert(name.clone(), encrypted);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.encrypt_object(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Reverses [`Encryptor::encrypt_object`]. A field that fails to decrypt is
    /// left in its encrypted form and logged; the rest of the record still decrypts.
    pub fn decrypt_object(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (name, field) in map {
                    let algorithm = field_policy(name).and_then(|p| p.algorithm);
                    let decrypted = match algorithm {
                        Some(algorithm) if field.is_object() => {
                            self.decrypt_field(name, field, algorithm)
                        }
                        _ => self.decrypt_object(field),
                    };
                    out.insert(name.clone(), decrypted);
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.decrypt_object(item)).collect())
            }
            other => other.clone(),
        }
    }

    fn decrypt_field(&self, name: &str, field: &Value, algorithm: Algorithm) -> Value {
        let outcome = serde_json::from_value::<EncryptionResult>(field.clone())
            .map_err(|e| AppError::Decryption(e.to_string()))
            .and_then(|result| self.decrypt_to_string(&result, None, algorithm));

        match outcome {
            Ok(plain) => Value::String(plain),
            Err(e) => {
                tracing::error!(field = %name, "❌ Field decryption failed: {}", e);
                field.clone()
            }
        }
    }
}

/// Masks fields flagged in the field table. Only for log output.
pub fn mask_sensitive_data(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(name, field)| {
                    let masked = match (field_policy(name), field) {
                        (Some(policy), Value::String(s)) if policy.mask => {
                            Value::String(mask_value(s))
                        }
                        _ => mask_sensitive_data(field),
                    };
                    (name.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive_data).collect()),
        other => other.clone(),
    }
}

/// Keeps the first and last two characters; values of four characters or fewer are fully masked.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let mut masked = String::with_capacity(value.len());
    masked.extend(&chars[..2]);
    masked.push_str(&"*".repeat(chars.len() - 4));
    masked.extend(&chars[chars.len() - 2..]);
    masked
}

/// Derives a key from a caller supplied secret and salt using Argon2.
fn derive_key(secret: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::default()
        .hash_password_into(secret.as_bytes(), salt, &mut key[..])
        .map_err(|e| AppError::Encryption(format!("Argon2 key derivation error: {}", e)))?;
    Ok(key)
}

fn pbkdf2_sha512(data: &[u8], salt: &[u8]) -> Zeroizing<[u8; HASH_LENGTH]> {
    let mut out = Zeroizing::new([0u8; HASH_LENGTH]);
    pbkdf2::pbkdf2_hmac::<Sha512>(data, salt, HASH_ITERATIONS, &mut out[..]);
    out
}

fn decode_field(value: &str, what: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|_| AppError::Decryption(format!("Invalid base64 in {}", what)))
}
