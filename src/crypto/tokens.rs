use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use rand::rngs::OsRng;

/// The size of the CSRF token in bytes.
const CSRF_TOKEN_SIZE: usize = 32;
/// The size of a session id in bytes (hex encoded to 64 chars).
const SESSION_ID_SIZE: usize = 32;

/// Generates a new random CSRF token.
///
/// # Returns
///
/// A URL-safe base64-encoded CSRF token.
pub fn generate_csrf_token() -> String {
    let mut token = [0u8; CSRF_TOKEN_SIZE];
    OsRng.fill_bytes(&mut token);

    general_purpose::URL_SAFE_NO_PAD.encode(token)
}

/// Generates a 256-bit session id, hex encoded.
pub fn generate_session_id() -> String {
    let mut id = [0u8; SESSION_ID_SIZE];
    OsRng.fill_bytes(&mut id);
    hex::encode(id)
}

/// Whether `id` has the shape of a session id issued by [`generate_session_id`].
pub fn is_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_SIZE * 2 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Issues a bearer token bound to `session_id`: `<session_id>.<keyed BLAKE3 tag>`.
pub fn issue_bearer_token(signing_key: &[u8; 32], session_id: &str) -> String {
    let tag = blake3::keyed_hash(signing_key, session_id.as_bytes());
    format!("{}.{}", session_id, tag.to_hex())
}

/// Verifies a bearer token and returns the session id it is bound to.
pub fn verify_bearer_token(signing_key: &[u8; 32], token: &str) -> Option<String> {
    let (session_id, tag_hex) = token.split_once('.')?;
    if !is_session_id(session_id) {
        return None;
    }

    let presented = blake3::Hash::from_hex(tag_hex).ok()?;
    let expected = blake3::keyed_hash(signing_key, session_id.as_bytes());

    // blake3::Hash equality is constant time.
    (presented == expected).then(|| session_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_256_bit_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 64);
        assert!(is_session_id(&id));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn bearer_tokens_bind_to_the_session_and_key() {
        let key = [7u8; 32];
        let id = generate_session_id();
        let token = issue_bearer_token(&key, &id);

        assert_eq!(verify_bearer_token(&key, &token), Some(id.clone()));
        assert_eq!(verify_bearer_token(&[8u8; 32], &token), None);

        let other = generate_session_id();
        let forged = format!("{}.{}", other, token.split_once('.').unwrap().1);
        assert_eq!(verify_bearer_token(&key, &forged), None);
    }

    #[test]
    fn csrf_tokens_clear_the_minimum_length() {
        assert!(generate_csrf_token().len() >= 16);
    }
}
