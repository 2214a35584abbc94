//! Sealed storage for provider API keys.
//!
//! The whole provider→key map is one [`EncryptedField`]. Callers persist the
//! encoded blob; plaintext keys only exist inside a [`CredentialMap`], which
//! wipes itself on drop.

use std::collections::BTreeMap;
use std::sync::Arc;

use pollivu_common::{AppError, AppResult, CryptoVault, EncryptedField};
use zeroize::Zeroize;

/// Longest accepted provider name.
const MAX_PROVIDER_LEN: usize = 32;

/// Provider name to API key.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialMap(BTreeMap<String, String>);

impl CredentialMap {
    /// Key stored for `provider`.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<&str> {
        self.0.get(provider).map(String::as_str)
    }

    /// Providers with a stored key.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Debug for CredentialMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl Drop for CredentialMap {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

/// Seals and opens credential maps with the process-wide vault.
#[derive(Clone)]
pub struct CredentialVault {
    vault: Arc<CryptoVault>,
}

impl CredentialVault {
    #[must_use]
    pub const fn new(vault: Arc<CryptoVault>) -> Self {
        Self { vault }
    }

    /// Encrypt a map into its encoded blob.
    pub fn seal(&self, credentials: &CredentialMap) -> AppResult<String> {
        Ok(self.vault.encrypt_json(&credentials.0)?.encode())
    }

    /// Decrypt a blob. `None` means nothing was ever stored.
    ///
    /// A blob that fails to decrypt is an error, never an empty map.
    pub fn open(&self, sealed: Option<&str>) -> AppResult<CredentialMap> {
        match sealed {
            None | Some("") => Ok(CredentialMap::default()),
            Some(blob) => {
                let field = EncryptedField::decode(blob)?;
                Ok(CredentialMap(self.vault.decrypt_json(&field)?))
            }
        }
    }

    /// Store `key` for `provider`, returning the new blob.
    pub fn set_key(&self, sealed: Option<&str>, provider: &str, key: &str) -> AppResult<String> {
        let provider = normalize_provider(provider)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::Validation("API key cannot be empty".to_string()));
        }

        let mut credentials = self.open(sealed)?;
        credentials.0.insert(provider, key.to_string());
        self.seal(&credentials)
    }

    /// Remove the key for `provider`, returning the new blob.
    pub fn remove_key(&self, sealed: Option<&str>, provider: &str) -> AppResult<String> {
        let provider = normalize_provider(provider)?;
        let mut credentials = self.open(sealed)?;
        if let Some(mut old) = credentials.0.remove(&provider) {
            old.zeroize();
        }
        self.seal(&credentials)
    }
}

fn normalize_provider(provider: &str) -> AppResult<String> {
    let provider = provider.trim().to_ascii_lowercase();
    let valid = !provider.is_empty()
        && provider.len() <= MAX_PROVIDER_LEN
        && provider
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(provider)
    } else {
        Err(AppError::Validation(format!(
            "Invalid provider name '{provider}'"
        )))
    }
}
