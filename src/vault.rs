use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("credential store unavailable: {0}")]
    Backend(String),
    #[error("credential store lock poisoned")]
    Poisoned,
}

impl From<keyring::Error> for Error {
    fn from(e: keyring::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

type Result<T> = ::std::result::Result<T, Error>;

/// Secret storage keyed by (service, account). Saves overwrite, a missing
/// account reads back as `None`. Implementations must serialize operations on
/// a given account. Secret values must never appear in logs.
pub trait CredentialVault: Send + Sync {
    fn save(&self, account: &str, secret: &str) -> Result<()>;
    fn get(&self, account: &str) -> Result<Option<String>>;
    fn delete(&self, account: &str) -> Result<()>;
}

/// Vault backed by the OS credential store, readable only while the device is
/// unlocked. One instance per app session; the service name scopes all
/// entries this binary owns.
pub struct KeyringVault {
    service: String,
}

impl KeyringVault {
    pub fn new(service: &str) -> Self {
        KeyringVault {
            service: service.to_string(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry> {
        Ok(keyring::Entry::new(&self.service, account)?)
    }
}

impl CredentialVault for KeyringVault {
    fn save(&self, account: &str, secret: &str) -> Result<()> {
        // set_password overwrites any existing value for the entry.
        Ok(self.entry(account)?.set_password(secret)?)
    }

    fn get(&self, account: &str) -> Result<Option<String>> {
        match self.entry(account)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, account: &str) -> Result<()> {
        match self.entry(account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory vault for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialVault for MemoryVault {
    fn save(&self, account: &str, secret: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| Error::Poisoned)?
            .insert(account.to_string(), secret.to_string());
        Ok(())
    }

    fn get(&self, account: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| Error::Poisoned)?
            .get(account)
            .cloned())
    }

    fn delete(&self, account: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| Error::Poisoned)?
            .remove(account);
        Ok(())
    }
}
