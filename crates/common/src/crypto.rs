//! Authenticated encryption for sensitive fields at rest.
//!
//! A single [`CryptoVault`] is built per process. Its AES-256-GCM key is
//! derived once from the configured secret and salt with Argon2id and is
//! never persisted or logged. Every encryption draws a fresh 96-bit nonce
//! from the OS random source, and decryption fails closed: a tag mismatch
//! yields [`AppError::Encryption`] and no plaintext at all.
//!
//! # Examples
//!
//! ```
//! use pollivu_common::crypto::CryptoVault;
//!
//! let vault = CryptoVault::derive(
//!     "0123456789abcdef0123456789abcdef",
//!     "fedcba9876543210",
//! ).expect("key derivation");
//!
//! let field = vault.encrypt_str("sk-live-secret").expect("encrypt");
//! assert_eq!(vault.decrypt_str(&field).expect("decrypt"), "sk-live-secret");
//! ```

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::{AppError, AppResult, config::SecurityConfig};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Argon2id memory cost in KiB.
const KDF_MEMORY_KIB: u32 = 19 * 1024;

/// Argon2id iteration count.
const KDF_ITERATIONS: u32 = 2;

/// Argon2id parallelism.
const KDF_PARALLELISM: u32 = 1;

/// A sealed sensitive value: nonce plus ciphertext with its appended tag.
///
/// This is the only form in which sensitive fields are persisted. The
/// encoded representation is `base64url(nonce || ciphertext || tag)`.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedField {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedField {
    /// Rebuild a field from its stored parts.
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>) -> AppResult<Self> {
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| AppError::Encryption("invalid nonce length".to_string()))?;
        if ciphertext.len() < TAG_LEN {
            return Err(AppError::Encryption("ciphertext too short".to_string()));
        }
        Ok(Self { nonce, ciphertext })
    }

    /// The nonce used for this encryption.
    #[must_use]
    pub const fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Ciphertext followed by the authentication tag.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Encode as a URL-safe base64 string for storage.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Decode a value produced by [`EncryptedField::encode`].
    pub fn decode(encoded: &str) -> AppResult<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| AppError::Encryption("malformed encrypted field".to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(AppError::Encryption("encrypted field too short".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        Self::from_parts(nonce, ciphertext.to_vec())
    }
}

impl std::fmt::Debug for EncryptedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedField")
            .field("len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

impl Serialize for EncryptedField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for EncryptedField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Process-wide authenticated encryption vault.
#[derive(Clone)]
pub struct CryptoVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoVault(<key redacted>)")
    }
}

impl CryptoVault {
    /// Derive the vault key from a long-term secret and a fixed salt.
    ///
    /// This is deliberately slow; call it once at startup.
    pub fn derive(secret: &str, salt: &str) -> AppResult<Self> {
        if secret.is_empty() || salt.is_empty() {
            return Err(AppError::Config(
                "encryption secret and salt must not be empty".to_string(),
            ));
        }

        let params = Params::new(
            KDF_MEMORY_KIB,
            KDF_ITERATIONS,
            KDF_PARALLELISM,
            Some(KEY_LEN),
        )
        .map_err(|e| AppError::Config(format!("invalid key derivation parameters: {e}")))?;

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(secret.as_bytes(), salt.as_bytes(), &mut key[..])
            .map_err(|e| AppError::Config(format!("key derivation failed: {e}")))?;

        Ok(Self::from_key(&key))
    }

    /// Derive the vault key from the `security` configuration section.
    pub fn from_config(security: &SecurityConfig) -> AppResult<Self> {
        security.validate()?;
        Self::derive(&security.secret_key, &security.salt)
    }

    /// Build a vault from raw key bytes.
    #[must_use]
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> AppResult<EncryptedField> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| AppError::Encryption("encryption failed".to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce.as_slice());
        Ok(EncryptedField {
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypt and authenticate a field.
    ///
    /// Any tag mismatch returns an error; no partial plaintext is exposed.
    pub fn decrypt(&self, field: &EncryptedField) -> AppResult<Zeroizing<Vec<u8>>> {
        let nonce = Nonce::from_slice(&field.nonce);
        self.cipher
            .decrypt(nonce, field.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| {
                tracing::warn!("Encrypted field failed authentication");
                AppError::Encryption("authentication failed".to_string())
            })
    }

    /// Encrypt a UTF-8 string.
    pub fn encrypt_str(&self, plaintext: &str) -> AppResult<EncryptedField> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt a field that holds UTF-8 text.
    pub fn decrypt_str(&self, field: &EncryptedField) -> AppResult<String> {
        let bytes = self.decrypt(field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| AppError::Encryption("decrypted field is not UTF-8".to_string()))
    }

    /// Encrypt a serializable value as JSON.
    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> AppResult<EncryptedField> {
        let json = Zeroizing::new(
            serde_json::to_vec(value)
                .map_err(|e| AppError::Internal(format!("failed to serialize value: {e}")))?,
        );
        self.encrypt(&json)
    }

    /// Decrypt a field that holds JSON.
    pub fn decrypt_json<T: for<'de> Deserialize<'de>>(&self, field: &EncryptedField) -> AppResult<T> {
        let bytes = self.decrypt(field)?;
        serde_json::from_slice(&bytes)
            .map_err(|_| AppError::Encryption("decrypted field is not valid JSON".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    static VAULT: Lazy<CryptoVault> = Lazy::new(|| {
        CryptoVault::derive("0123456789abcdef0123456789abcdef", "fedcba9876543210").unwrap()
    });

    #[test]
    fn test_round_trip() {
        let field = VAULT.encrypt_str("What is your favourite colour?").unwrap();
        assert_eq!(
            VAULT.decrypt_str(&field).unwrap(),
            "What is your favourite colour?"
        );
    }

    #[test]
    fn test_round_trip_empty_plaintext() {
        let field = VAULT.encrypt(b"").unwrap();
        assert_eq!(field.ciphertext().len(), TAG_LEN);
        assert!(VAULT.decrypt(&field).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_ciphertext_fails_closed() {
        let field = VAULT.encrypt_str("api-key-123").unwrap();
        for i in 0..field.ciphertext().len() {
            let mut bytes = field.ciphertext().to_vec();
            bytes[i] ^= 0x01;
            let tampered = EncryptedField::from_parts(field.nonce(), bytes).unwrap();
            assert!(matches!(
                VAULT.decrypt(&tampered),
                Err(AppError::Encryption(_))
            ));
        }
    }

    #[test]
    fn test_tampered_nonce_fails_closed() {
        let field = VAULT.encrypt_str("api-key-123").unwrap();
        let mut nonce = *field.nonce();
        nonce[0] ^= 0x80;
        let tampered = EncryptedField::from_parts(&nonce, field.ciphertext().to_vec()).unwrap();
        assert!(VAULT.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let a = VAULT.encrypt_str("same").unwrap();
        let b = VAULT.encrypt_str("same").unwrap();
        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.ciphertext(), b.ciphertext());
    }

    #[test]
    fn test_wrong_key_fails() {
        let other = CryptoVault::from_key(&[7u8; KEY_LEN]);
        let field = VAULT.encrypt_str("secret").unwrap();
        assert!(other.decrypt(&field).is_err());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let again =
            CryptoVault::derive("0123456789abcdef0123456789abcdef", "fedcba9876543210").unwrap();
        let field = VAULT.encrypt_str("shared").unwrap();
        assert_eq!(again.decrypt_str(&field).unwrap(), "shared");
    }

    #[test]
    fn test_encode_decode() {
        let field = VAULT.encrypt_str("encoded").unwrap();
        let decoded = EncryptedField::decode(&field.encode()).unwrap();
        assert_eq!(decoded, field);
        assert!(EncryptedField::decode("not base64 !!").is_err());
        assert!(EncryptedField::decode("AAAA").is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            CryptoVault::derive("", "fedcba9876543210"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_debug_does_not_leak() {
        let field = VAULT.encrypt_str("plaintext").unwrap();
        assert!(!format!("{field:?}").contains("plaintext"));
        assert!(format!("{:?}", *VAULT).contains("redacted"));
    }
}
