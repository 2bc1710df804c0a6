//! AES-256-GCM encryption for client secrets and stored tokens.
//!
//! Each value is encrypted separately with a unique nonce. The AES key is the
//! SHA-256 digest of the configured master key, which must be at least 32
//! characters long.
//!
//! Ciphertext wire form: `hex(nonce):hex(ciphertext || tag)`.

use crate::config::ConfigProvider;
use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;

/// Config key holding the master key
pub const ENCRYPTION_KEY_VAR: &str = "ENCRYPTION_KEY";

/// Minimum master key length in characters
const MIN_MASTER_KEY_LEN: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Placeholder keys shipped in sample configs. Accepted, but loudly.
const INSECURE_DEFAULT_KEYS: &[&str] = &[
    "your-32-character-encryption-key-here",
    "change-me-to-a-random-32-char-string!!",
    "00000000000000000000000000000000",
    "default-encryption-key-change-in-production",
];

/// Validated AES-256 key material.
#[derive(Clone)]
pub struct KeyMaterial([u8; 32]);

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Validates the master key and derives the AES key from it.
///
/// # Returns
/// * `Ok(KeyMaterial)` - 32-byte derived key
/// * `Err(Error::Configuration)` - If the key is missing or shorter than 32 characters
pub fn validate_key(master_key: Option<&str>) -> Result<KeyMaterial> {
    let master_key = match master_key {
        Some(key) if !key.is_empty() => key,
        _ => {
            return Err(Error::Configuration(format!(
                "{} is not set",
                ENCRYPTION_KEY_VAR
            )))
        }
    };

    let len = master_key.chars().count();
    if len < MIN_MASTER_KEY_LEN {
        return Err(Error::Configuration(format!(
            "{} must be at least {} characters, got {}",
            ENCRYPTION_KEY_VAR, MIN_MASTER_KEY_LEN, len
        )));
    }

    if INSECURE_DEFAULT_KEYS.contains(&master_key) {
        warn!(
            "{} is set to a known sample value; replace it before storing real credentials",
            ENCRYPTION_KEY_VAR
        );
    }

    let digest = Sha256::digest(master_key.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);

    Ok(KeyMaterial(key))
}

/// Symmetric cipher owning validated key material.
///
/// Constructed once at startup and shared (`Arc`) with everything that needs
/// to encrypt or decrypt.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretCipher(<redacted>)")
    }
}

impl SecretCipher {
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    /// Validates a master key and builds the cipher from it.
    pub fn from_master_key(master_key: &str) -> Result<Self> {
        Ok(Self::new(&validate_key(Some(master_key))?))
    }

    /// Reads `ENCRYPTION_KEY` from the given provider.
    pub fn from_config(provider: &dyn ConfigProvider) -> Result<Self> {
        let master_key = provider.get(ENCRYPTION_KEY_VAR);
        Ok(Self::new(&validate_key(master_key.as_deref())?))
    }

    /// Encrypts plaintext with a fresh random nonce.
    ///
    /// Two calls with the same plaintext never produce the same output.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(format!("{}:{}", hex::encode(nonce), hex::encode(ciphertext)))
    }

    /// Decrypts a value produced by [`SecretCipher::encrypt`].
    ///
    /// Fails with `Error::Decryption` if the value is not `hex:hex` with
    /// exactly one separator, or if authentication fails (wrong key or
    /// tampered data).
    pub fn decrypt(&self, token: &str) -> Result<String> {
        let mut parts = token.split(':');
        let (nonce_hex, ciphertext_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(nonce), Some(ciphertext), None) if !nonce.is_empty() && !ciphertext.is_empty() => {
                (nonce, ciphertext)
            }
            _ => {
                return Err(Error::Decryption(
                    "expected exactly one ':' between nonce and ciphertext".to_string(),
                ))
            }
        };

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|e| Error::Decryption(format!("nonce is not valid hex: {}", e)))?;
        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|e| Error::Decryption(format!("ciphertext is not valid hex: {}", e)))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(Error::Decryption(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| {
                Error::Decryption("authentication failed (wrong key or corrupted data)".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Decryption("decrypted data is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigProvider;

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef";

    fn cipher() -> SecretCipher {
        SecretCipher::from_master_key(TEST_KEY).unwrap()
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key(Some(TEST_KEY)).is_ok());

        // Longer keys are fine
        assert!(validate_key(Some(&"k".repeat(64))).is_ok());

        // Too short
        let err = validate_key(Some("short")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        // 31 characters
        assert!(validate_key(Some(&"k".repeat(31))).is_err());

        // Missing or empty
        assert!(matches!(validate_key(None), Err(Error::Configuration(_))));
        assert!(matches!(validate_key(Some("")), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_insecure_default_is_accepted() {
        // Only a warning, never a hard failure
        assert!(validate_key(Some("your-32-character-encryption-key-here")).is_ok());
    }

    #[test]
    fn test_from_config() {
        let provider = MapConfigProvider::from_pairs([(ENCRYPTION_KEY_VAR, TEST_KEY)]);
        assert!(SecretCipher::from_config(&provider).is_ok());

        let empty = MapConfigProvider::default();
        assert!(matches!(
            SecretCipher::from_config(&empty),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = cipher();
        let plaintext = "my-client-secret-12345";

        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        assert!(!encrypted.contains(plaintext));

        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_roundtrip_edge_values() {
        let cipher = cipher();
        for plaintext in ["", "ç ã é ü 漢字", "a:b:c", &"x".repeat(4096)] {
            let encrypted = cipher.encrypt(plaintext).unwrap();
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_output_shape() {
        let encrypted = cipher().encrypt("secret").unwrap();
        let (nonce, ciphertext) = encrypted.split_once(':').unwrap();

        assert_eq!(nonce.len(), NONCE_SIZE * 2);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(ciphertext.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!ciphertext.contains(':'));
    }

    #[test]
    fn test_different_nonces() {
        let cipher = cipher();
        let plaintext = "same-plaintext";

        let first = cipher.encrypt(plaintext).unwrap();
        let second = cipher.encrypt(plaintext).unwrap();

        // Nonces (and therefore ciphertexts) should differ
        assert_ne!(first.split(':').next(), second.split(':').next());
        assert_ne!(first, second);

        assert_eq!(cipher.decrypt(&first).unwrap(), plaintext);
        assert_eq!(cipher.decrypt(&second).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = cipher().encrypt("secret").unwrap();
        let other = SecretCipher::from_master_key("fedcba9876543210fedcba9876543210").unwrap();

        assert!(matches!(other.decrypt(&encrypted), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = cipher();
        let encrypted = cipher.encrypt("secret").unwrap();

        // Flip the last hex digit
        let mut tampered = encrypted.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });

        assert!(matches!(cipher.decrypt(&tampered), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let cipher = cipher();
        let valid = cipher.encrypt("secret").unwrap();
        let (nonce, ciphertext) = valid.split_once(':').unwrap();

        let malformed = [
            "".to_string(),
            "no-separator".to_string(),
            format!("{}:{}:{}", nonce, ciphertext, ciphertext),
            format!(":{}", ciphertext),
            format!("{}:", nonce),
            format!("zz{}:{}", &nonce[2..], ciphertext),
            format!("{}:{}g", nonce, ciphertext),
            format!("{}:{}", &nonce[..8], ciphertext),
        ];

        for token in malformed {
            assert!(
                matches!(cipher.decrypt(&token), Err(Error::Decryption(_))),
                "expected decryption error for {:?}",
                token
            );
        }
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = validate_key(Some(TEST_KEY)).unwrap();
        assert_eq!(format!("{:?}", key), "KeyMaterial(<redacted>)");
        assert_eq!(format!("{:?}", cipher()), "SecretCipher(<redacted>)");
    }
}
