//! Authenticated encryption for secrets at rest, and token hashing for
//! bearer-token lookups.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CinchError, Result};

const NONCE_LEN: usize = 12;
const ENC_PREFIX: &str = "enc:";

/// Decodes a configured key string (hex or base64, 32 bytes either way) into
/// raw key bytes.
fn decode_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(raw).map_err(|e| CinchError::Config(format!("invalid hex secret key: {e}")))?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| CinchError::Config(format!("invalid base64 secret key: {e}")))?
    };
    bytes
        .try_into()
        .map_err(|_| CinchError::Config("secret key must decode to exactly 32 bytes".into()))
}

/// Encrypts and decrypts secret-at-rest fields with AES-256-GCM, trying a
/// secondary key on decrypt failure so operators can rotate without a flag
/// day.
pub struct Cipher {
    primary: Aes256Gcm,
    secondary: Option<Aes256Gcm>,
}

impl Cipher {
    pub fn new(primary_key: &str, secondary_key: Option<&str>) -> Result<Self> {
        let primary = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&decode_key(primary_key)?));
        let secondary = secondary_key
            .map(decode_key)
            .transpose()?
            .map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&k)));
        Ok(Self { primary, secondary })
    }

    /// Encrypts `plaintext`, returning an `enc:<base64(nonce || ciphertext)>`
    /// string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .primary
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CinchError::Config("encryption failed".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(format!(
            "{ENC_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(combined)
        ))
    }

    /// Decrypts a value produced by `encrypt`. Tries the primary key first,
    /// then the secondary key if configured.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let encoded = encoded
            .strip_prefix(ENC_PREFIX)
            .ok_or_else(|| CinchError::Config("value is not an enc: ciphertext".into()))?;
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CinchError::KeyMismatch)?;
        if combined.len() < NONCE_LEN {
            return Err(CinchError::KeyMismatch);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        if let Ok(plaintext) = self.primary.decrypt(nonce, ciphertext) {
            return String::from_utf8(plaintext).map_err(|_| CinchError::KeyMismatch);
        }
        if let Some(secondary) = &self.secondary {
            if let Ok(plaintext) = secondary.decrypt(nonce, ciphertext) {
                return String::from_utf8(plaintext).map_err(|_| CinchError::KeyMismatch);
            }
        }
        Err(CinchError::KeyMismatch)
    }
}

/// One-way hash of a bearer token for lookup-by-hash storage. Tokens are
/// never stored or compared in plaintext.
pub fn hash_token(raw_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Cipher {
        Cipher::new(
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            None,
        )
        .unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let cipher = test_cipher();
        let secret = "super-secret-webhook-value";
        let encrypted = cipher.encrypt(secret).unwrap();
        assert!(encrypted.starts_with(ENC_PREFIX));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), secret);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let cipher = test_cipher();
        let encrypted = cipher.encrypt("hello").unwrap();

        let other = Cipher::new(
            "fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210",
            None,
        )
        .unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn secondary_key_allows_rotation() {
        let old_key = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let new_key = "fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

        let old_cipher = Cipher::new(old_key, None).unwrap();
        let encrypted_under_old = old_cipher.encrypt("rotate-me").unwrap();

        let rotated_cipher = Cipher::new(new_key, Some(old_key)).unwrap();
        assert_eq!(rotated_cipher.decrypt(&encrypted_under_old).unwrap(), "rotate-me");
    }

    #[test]
    fn hash_token_is_deterministic_and_one_way() {
        let h1 = hash_token("abc");
        let h2 = hash_token("abc");
        assert_eq!(h1, h2);
        assert_ne!(h1, "abc");
    }
}
