//! Where the account password comes from.
//!
//! The environment wins over the OS keyring. A password found in the
//! environment is copied into the keyring so later runs work without it.

use std::sync::Arc;

use keyring::Entry;

use super::error::AuthError;

pub const KEYRING_SERVICE: &str = "icloud-sync-rs";
pub const ENV_PASSWORD: &str = "ENV_ICLOUD_PASSWORD";

/// Persistent secret storage keyed by account name.
pub trait SecretStore: Send + Sync {
    fn get(&self, account: &str) -> Result<Option<String>, AuthError>;
    fn set(&self, account: &str, secret: &str) -> Result<(), AuthError>;
}

/// Secrets in the platform keychain (macOS Keychain, Windows Credential
/// Manager, Linux kernel keyutils).
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, account: &str) -> Result<Option<String>, AuthError> {
        let entry = Entry::new(&self.service, account)?;
        match entry.get_password() {
            Ok(secret) => {
                tracing::debug!(account, "Password read from keyring");
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => {
                tracing::debug!(account, "No password in keyring");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, account: &str, secret: &str) -> Result<(), AuthError> {
        Entry::new(&self.service, account)?.set_password(secret)?;
        tracing::debug!(account, "Password stored in keyring");
        Ok(())
    }
}

pub struct CredentialSource {
    env_password: Option<String>,
    store: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSource")
            .field("env_password", &self.env_password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl CredentialSource {
    pub fn new(env_password: Option<String>, store: Arc<dyn SecretStore>) -> Self {
        Self {
            env_password: env_password.filter(|p| !p.is_empty()),
            store,
        }
    }

    /// Read the override from `ENV_ICLOUD_PASSWORD`.
    pub fn from_env(store: Arc<dyn SecretStore>) -> Self {
        Self::new(std::env::var(ENV_PASSWORD).ok(), store)
    }

    pub fn password(&self, username: &str) -> Result<Option<String>, AuthError> {
        if let Some(password) = &self.env_password {
            self.remember(username, password);
            return Ok(Some(password.clone()));
        }
        self.store.get(username)
    }

    /// Copy an environment password into the store. Failures only warn.
    fn remember(&self, username: &str, password: &str) {
        match self.store.get(username) {
            Ok(Some(stored)) if stored == password => {}
            _ => {
                if let Err(e) = self.store.set(username, password) {
                    tracing::warn!(username, error = %e, "Could not save password to keyring");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) secrets: Mutex<HashMap<String, String>>,
        pub(crate) fail_writes: bool,
    }

    impl MemoryStore {
        pub(crate) fn with(account: &str, secret: &str) -> Self {
            let store = Self::default();
            store
                .secrets
                .lock()
                .unwrap()
                .insert(account.into(), secret.into());
            store
        }
    }

    impl SecretStore for MemoryStore {
        fn get(&self, account: &str) -> Result<Option<String>, AuthError> {
            Ok(self.secrets.lock().unwrap().get(account).cloned())
        }

        fn set(&self, account: &str, secret: &str) -> Result<(), AuthError> {
            if self.fail_writes {
                return Err(AuthError::SecretStore("read-only".into()));
            }
            self.secrets
                .lock()
                .unwrap()
                .insert(account.into(), secret.into());
            Ok(())
        }
    }
}
