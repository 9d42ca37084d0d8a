//! Credential storage for LLM provider API keys.
//!
//! Provides a trait-based abstraction over credential storage with four implementations:
//! - `EnvCredentialStore`: Reads keys from environment variables (the default).
//! - `KeyringCredentialStore`: Uses the OS-native credential store (macOS Keychain,
//!   Windows Credential Manager, Linux kernel keyutils).
//! - `InMemoryCredentialStore`: In-memory store for testing.
//! - `LayeredCredentialStore`: Consults several stores in order.

use crate::types::Provider;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SERVICE_NAME: &str = "rosin";

/// Errors from credential storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential not found for {service}:{account}")]
    NotFound { service: String, account: String },

    #[error("Failed to store credential: {message}")]
    StoreFailed { message: String },

    #[error("Failed to delete credential: {message}")]
    DeleteFailed { message: String },

    #[error("Keyring backend not available: {message}")]
    BackendUnavailable { message: String },
}

/// Trait for credential storage backends.
pub trait CredentialStore: Send + Sync {
    /// Store an API key for the given provider.
    fn store_key(&self, provider: Provider, api_key: &str) -> Result<(), CredentialError>;

    /// Retrieve the API key for the given provider.
    fn get_key(&self, provider: Provider) -> Result<String, CredentialError>;

    /// Delete the API key for the given provider.
    fn delete_key(&self, provider: Provider) -> Result<(), CredentialError>;

    /// Check whether a key exists for the given provider.
    fn has_key(&self, provider: Provider) -> bool {
        self.get_key(provider).is_ok()
    }
}

/// Account name under which a provider's key is stored, `"provider:{id}"`.
pub fn account_name(provider: Provider) -> String {
    format!("provider:{}", provider.id())
}

/// Read-only store backed by environment variables.
///
/// Empty or whitespace-only values count as missing.
pub struct EnvCredentialStore {
    vars: HashMap<Provider, String>,
}

impl EnvCredentialStore {
    /// Use each provider's conventional variable (`OPENAI_API_KEY`, ...).
    pub fn new() -> Self {
        Self {
            vars: Provider::ALL
                .iter()
                .map(|p| (*p, p.default_api_key_env().to_string()))
                .collect(),
        }
    }

    /// Override the variable consulted for one provider.
    pub fn with_var(mut self, provider: Provider, var: impl Into<String>) -> Self {
        self.vars.insert(provider, var.into());
        self
    }

    pub fn var_for(&self, provider: Provider) -> &str {
        self.vars
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| provider.default_api_key_env())
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn store_key(&self, provider: Provider, _api_key: &str) -> Result<(), CredentialError> {
        Err(CredentialError::StoreFailed {
            message: format!(
                "environment store is read-only; set {} instead",
                self.var_for(provider)
            ),
        })
    }

    fn get_key(&self, provider: Provider) -> Result<String, CredentialError> {
        let var = self.var_for(provider);
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(CredentialError::NotFound {
                service: "env".to_string(),
                account: var.to_string(),
            }),
        }
    }

    fn delete_key(&self, provider: Provider) -> Result<(), CredentialError> {
        Err(CredentialError::DeleteFailed {
            message: format!(
                "environment store is read-only; unset {} instead",
                self.var_for(provider)
            ),
        })
    }
}

/// OS-native credential store using the `keyring` crate.
///
/// Stores credentials under service `"rosin"` with account names
/// formatted as `"provider:{id}"`.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    /// Create a new keyring-backed credential store.
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    fn entry(&self, provider: Provider) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, &account_name(provider)).map_err(|e| {
            CredentialError::BackendUnavailable {
                message: e.to_string(),
            }
        })
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn store_key(&self, provider: Provider, api_key: &str) -> Result<(), CredentialError> {
        self.entry(provider)?
            .set_password(api_key)
            .map_err(|e| CredentialError::StoreFailed {
                message: e.to_string(),
            })
    }

    fn get_key(&self, provider: Provider) -> Result<String, CredentialError> {
        self.entry(provider)?.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => CredentialError::NotFound {
                service: self.service.clone(),
                account: account_name(provider),
            },
            other => CredentialError::StoreFailed {
                message: other.to_string(),
            },
        })
    }

    fn delete_key(&self, provider: Provider) -> Result<(), CredentialError> {
        self.entry(provider)?
            .delete_credential()
            .map_err(|e| CredentialError::DeleteFailed {
                message: e.to_string(),
            })
    }
}

/// In-memory credential store for testing.
///
/// Thread-safe via `Mutex<HashMap>`. Does not persist across process restarts.
pub struct InMemoryCredentialStore {
    store: Mutex<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    /// Create an empty in-memory credential store.
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Build a store pre-populated with keys.
    pub fn with_keys<'a>(keys: impl IntoIterator<Item = (Provider, &'a str)>) -> Self {
        let store = Self::new();
        for (provider, key) in keys {
            let _ = store.store_key(provider, key);
        }
        store
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn store_key(&self, provider: Provider, api_key: &str) -> Result<(), CredentialError> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_name(provider), api_key.to_string());
        Ok(())
    }

    fn get_key(&self, provider: Provider) -> Result<String, CredentialError> {
        let account = account_name(provider);
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&account)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound {
                service: SERVICE_NAME.to_string(),
                account,
            })
    }

    fn delete_key(&self, provider: Provider) -> Result<(), CredentialError> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&account_name(provider));
        Ok(())
    }

    fn has_key(&self, provider: Provider) -> bool {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&account_name(provider))
    }
}

/// Checks each inner store in order; the first hit wins.
///
/// Writes and deletes go to the first store only.
pub struct LayeredCredentialStore {
    layers: Vec<Arc<dyn CredentialStore>>,
}

impl LayeredCredentialStore {
    pub fn new(layers: Vec<Arc<dyn CredentialStore>>) -> Self {
        Self { layers }
    }

    /// Environment first, then the OS keyring.
    pub fn env_then_keyring(env: EnvCredentialStore) -> Self {
        Self::new(vec![
            Arc::new(env),
            Arc::new(KeyringCredentialStore::new()),
        ])
    }
}

impl CredentialStore for LayeredCredentialStore {
    fn store_key(&self, provider: Provider, api_key: &str) -> Result<(), CredentialError> {
        match self.layers.first() {
            Some(layer) => layer.store_key(provider, api_key),
            None => Err(CredentialError::BackendUnavailable {
                message: "no credential stores configured".to_string(),
            }),
        }
    }

    fn get_key(&self, provider: Provider) -> Result<String, CredentialError> {
        let mut last_err = CredentialError::NotFound {
            service: SERVICE_NAME.to_string(),
            account: account_name(provider),
        };
        for layer in &self.layers {
            match layer.get_key(provider) {
                Ok(key) => return Ok(key),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn delete_key(&self, provider: Provider) -> Result<(), CredentialError> {
        match self.layers.first() {
            Some(layer) => layer.delete_key(provider),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> InMemoryCredentialStore {
        InMemoryCredentialStore::new()
    }

    #[test]
    fn test_store_and_retrieve_key() {
        let store = make_store();
        store.store_key(Provider::OpenAi, "sk-test-123").unwrap();
        assert_eq!(store.get_key(Provider::OpenAi).unwrap(), "sk-test-123");
    }

    #[test]
    fn test_get_nonexistent_key() {
        let store = make_store();
        let result = store.get_key(Provider::Gemini);
        assert!(matches!(
            result.unwrap_err(),
            CredentialError::NotFound { .. }
        ));
    }

    #[test]
    fn test_delete_key() {
        let store = make_store();
        store.store_key(Provider::Anthropic, "sk-ant-test").unwrap();
        store.delete_key(Provider::Anthropic).unwrap();
        assert!(!store.has_key(Provider::Anthropic));
    }

    #[test]
    fn test_overwrite_key() {
        let store = make_store();
        store.store_key(Provider::OpenAi, "sk-old").unwrap();
        store.store_key(Provider::OpenAi, "sk-new").unwrap();
        assert_eq!(store.get_key(Provider::OpenAi).unwrap(), "sk-new");
    }

    #[test]
    fn test_account_name_format() {
        assert_eq!(account_name(Provider::OpenAi), "provider:openai");
        assert_eq!(account_name(Provider::Xai), "provider:xai");
    }

    #[test]
    fn test_env_store_missing_var() {
        let store = EnvCredentialStore::new()
            .with_var(Provider::Xai, "ROSIN_TEST_SURELY_UNSET_XAI_KEY_5F2C");
        assert!(!store.has_key(Provider::Xai));
        assert!(store.store_key(Provider::Xai, "k").is_err());
    }

    #[test]
    fn test_env_store_var_override() {
        let store = EnvCredentialStore::new().with_var(Provider::Gemini, "GOOGLE_API_KEY");
        assert_eq!(store.var_for(Provider::Gemini), "GOOGLE_API_KEY");
        assert_eq!(store.var_for(Provider::OpenAi), "OPENAI_API_KEY");
    }

    #[test]
    fn test_layered_store_first_hit_wins() {
        let first = Arc::new(InMemoryCredentialStore::with_keys([(Provider::OpenAi, "a")]));
        let second = Arc::new(InMemoryCredentialStore::with_keys([
            (Provider::OpenAi, "b"),
            (Provider::Gemini, "g"),
        ]));
        let layered = LayeredCredentialStore::new(vec![first.clone(), second]);
        assert_eq!(layered.get_key(Provider::OpenAi).unwrap(), "a");
        assert_eq!(layered.get_key(Provider::Gemini).unwrap(), "g");
        assert!(!layered.has_key(Provider::Xai));

        layered.store_key(Provider::Xai, "x").unwrap();
        assert!(first.has_key(Provider::Xai));
    }

    #[test]
    fn test_layered_store_empty() {
        let layered = LayeredCredentialStore::new(Vec::new());
        assert!(!layered.has_key(Provider::OpenAi));
        assert!(layered.store_key(Provider::OpenAi, "k").is_err());
    }
}
