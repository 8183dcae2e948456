use std::fmt;
use std::str::FromStr;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use aes_gcm::{
    Aes256Gcm,
    aead::{
        AeadCore, AeadInPlace, KeyInit, OsRng,
        generic_array::{GenericArray, typenum::Unsigned},
        rand_core::RngCore,
    },
};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AppError, Result};

/// The size of every symmetric key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the CBC initialization vector in bytes.
pub const CBC_IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Supported symmetric algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    #[default]
    Aes256Gcm,
    Aes256Cbc,
    ChaCha20Poly1305,
}

impl Algorithm {
    /// AEAD modes carry an authentication tag; CBC does not.
    pub fn is_aead(self) -> bool {
        !matches!(self, Algorithm::Aes256Cbc)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::Aes256Cbc => "aes-256-cbc",
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(Algorithm::Aes256Gcm),
            "aes-256-cbc" | "aes256cbc" => Ok(Algorithm::Aes256Cbc),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            other => Err(AppError::Encryption(format!("Unsupported algorithm: {}", other))),
        }
    }
}

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Copies a key out of a slice, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| AppError::Encryption("Invalid key size".to_string()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Generates a new random 256-bit key.
pub fn generate_key() -> SecureKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecureKey::new(key)
}

/// Fills a fresh buffer from the OS RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Raw output of one encryption call.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Option<Vec<u8>>,
}

/// Encrypts `plaintext` under `key`. A fresh random IV is drawn on every call.
pub fn encrypt(algorithm: Algorithm, key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Sealed> {
    match algorithm {
        Algorithm::Aes256Gcm => seal_aead::<Aes256Gcm>(key, plaintext),
        Algorithm::ChaCha20Poly1305 => seal_aead::<ChaCha20Poly1305>(key, plaintext),
        Algorithm::Aes256Cbc => {
            let iv = random_bytes(CBC_IV_SIZE);
            let ciphertext = Aes256CbcEnc::new_from_slices(key, &iv)
                .map_err(|e| AppError::Encryption(format!("CBC init failed: {}", e)))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
            Ok(Sealed {
                ciphertext,
                iv,
                tag: None,
            })
        }
    }
}

/// Decrypts and, for AEAD modes, verifies the tag. Never returns partial plaintext.
pub fn decrypt(
    algorithm: Algorithm,
    key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    iv: &[u8],
    tag: Option<&[u8]>,
) -> Result<Vec<u8>> {
    match algorithm {
        Algorithm::Aes256Gcm => open_aead::<Aes256Gcm>(key, ciphertext, iv, tag),
        Algorithm::ChaCha20Poly1305 => open_aead::<ChaCha20Poly1305>(key, ciphertext, iv, tag),
        Algorithm::Aes256Cbc => {
            if iv.len() != CBC_IV_SIZE {
                return Err(AppError::Decryption("Invalid IV size".to_string()));
            }
            Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|e| AppError::Decryption(format!("CBC init failed: {}", e)))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| AppError::Decryption("Invalid padding".to_string()))
        }
    }
}

fn seal_aead<C>(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Sealed>
where
    C: AeadInPlace + KeyInit,
{
    let cipher = C::new_from_slice(key)
        .map_err(|_| AppError::Encryption("Invalid key size".to_string()))?;

    let iv = random_bytes(<C as AeadCore>::NonceSize::USIZE);
    let mut buffer = plaintext.to_vec();

    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
        .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

    Ok(Sealed {
        ciphertext: buffer,
        iv,
        tag: Some(tag.to_vec()),
    })
}

fn open_aead<C>(
    key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    iv: &[u8],
    tag: Option<&[u8]>,
) -> Result<Vec<u8>>
where
    C: AeadInPlace + KeyInit,
{
    let tag = tag.ok_or_else(|| {
        AppError::Decryption("Authentication tag is required for AEAD decryption".to_string())
    })?;

    if iv.len() != <C as AeadCore>::NonceSize::USIZE {
        return Err(AppError::Decryption("Invalid nonce size".to_string()));
    }
    if tag.len() != <C as AeadCore>::TagSize::USIZE {
        return Err(AppError::Decryption("Invalid authentication tag size".to_string()));
    }

    let cipher = C::new_from_slice(key)
        .map_err(|_| AppError::Decryption("Invalid key size".to_string()))?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| AppError::Decryption("Authentication tag mismatch".to_string()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Algorithm; 3] = [
        Algorithm::Aes256Gcm,
        Algorithm::Aes256Cbc,
        Algorithm::ChaCha20Poly1305,
    ];

    #[test]
    fn round_trips_empty_and_large_inputs() {
        let key = generate_key();
        let large = vec![0xA5u8; 1024 * 1024 + 7];

        for algorithm in ALL {
            for plaintext in [&b""[..], &large[..]] {
                let sealed = encrypt(algorithm, key.as_bytes(), plaintext).unwrap();
                assert_eq!(sealed.tag.is_some(), algorithm.is_aead());
                let opened = decrypt(
                    algorithm,
                    key.as_bytes(),
                    &sealed.ciphertext,
                    &sealed.iv,
                    sealed.tag.as_deref(),
                )
                .unwrap();
                assert_eq!(opened, plaintext, "{}", algorithm);
            }
        }
    }

    #[test]
    fn every_call_draws_a_fresh_iv() {
        let key = generate_key();
        for algorithm in ALL {
            let a = encrypt(algorithm, key.as_bytes(), b"same").unwrap();
            let b = encrypt(algorithm, key.as_bytes(), b"same").unwrap();
            assert_ne!(a.iv, b.iv);
        }
    }

    #[test]
    fn aead_rejects_flipped_bits() {
        let key = generate_key();
        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let sealed = encrypt(algorithm, key.as_bytes(), b"attack at dawn").unwrap();
            let tag = sealed.tag.clone().unwrap();

            for bit in 0..tag.len() * 8 {
                let mut bad_tag = tag.clone();
                bad_tag[bit / 8] ^= 1 << (bit % 8);
                let err = decrypt(
                    algorithm,
                    key.as_bytes(),
                    &sealed.ciphertext,
                    &sealed.iv,
                    Some(&bad_tag),
                )
                .unwrap_err();
                assert!(matches!(err, AppError::Decryption(_)));
            }

            for bit in 0..sealed.ciphertext.len() * 8 {
                let mut bad = sealed.ciphertext.clone();
                bad[bit / 8] ^= 1 << (bit % 8);
                let result = decrypt(algorithm, key.as_bytes(), &bad, &sealed.iv, Some(&tag));
                assert!(matches!(result, Err(AppError::Decryption(_))));
            }
        }
    }

    #[test]
    fn aead_without_tag_is_a_hard_error() {
        let key = generate_key();
        let sealed = encrypt(Algorithm::Aes256Gcm, key.as_bytes(), b"x").unwrap();
        let err = decrypt(
            Algorithm::Aes256Gcm,
            key.as_bytes(),
            &sealed.ciphertext,
            &sealed.iv,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Decryption(_)));
    }

    #[test]
    fn unknown_algorithm_names_are_rejected() {
        assert!(matches!(
            "des-ede3".parse::<Algorithm>(),
            Err(AppError::Encryption(_))
        ));
        assert_eq!(
            "AES-256-GCM".parse::<Algorithm>().unwrap(),
            Algorithm::Aes256Gcm
        );
    }
}
