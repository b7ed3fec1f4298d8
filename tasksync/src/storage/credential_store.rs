use std::env;
use std::sync::Arc;

use keyring::Entry;
use thiserror::Error;

use super::encrypted_file_store::{EncryptedFileError, EncryptedFileStore};
use crate::model::Provider;

const SERVICE_NAME: &str = "io.tasksync";
const PROBE_KEY: &str = "__probe__";
const BACKEND_ENV: &str = "TASKSYNC_CREDENTIAL_BACKEND";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("encrypted file storage error: {0}")]
    File(#[from] EncryptedFileError),
    #[error("TASKSYNC_CREDENTIAL_BACKEND has unsupported value {0:?}")]
    InvalidBackend(String),
}

/// Where provider secrets live. The sync engine only ever sees this trait.
pub trait CredentialStore: Send + Sync {
    fn get(&self, provider: Provider, key: &str) -> Result<Option<String>, CredentialError>;
    fn set(&self, provider: Provider, key: &str, value: &str) -> Result<(), CredentialError>;
    fn delete(&self, provider: Provider, key: &str) -> Result<(), CredentialError>;
    fn backend_name(&self) -> &'static str;
}

pub struct KeyringCredentialStore;

impl KeyringCredentialStore {
    fn entry(provider: Provider, key: &str) -> Result<Entry, CredentialError> {
        Ok(Entry::new(
            SERVICE_NAME,
            &format!("{}/{key}", provider.as_str()),
        )?)
    }

    /// True when the platform keyring answers at all. A missing entry counts
    /// as available.
    pub fn probe() -> bool {
        let Ok(entry) = Entry::new(SERVICE_NAME, PROBE_KEY) else {
            return false;
        };
        matches!(entry.get_password(), Ok(_) | Err(keyring::Error::NoEntry))
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, provider: Provider, key: &str) -> Result<Option<String>, CredentialError> {
        match Self::entry(provider, key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, provider: Provider, key: &str, value: &str) -> Result<(), CredentialError> {
        Self::entry(provider, key)?.set_password(value)?;
        Ok(())
    }

    fn delete(&self, provider: Provider, key: &str) -> Result<(), CredentialError> {
        match Self::entry(provider, key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "keyring"
    }
}

impl CredentialStore for EncryptedFileStore {
    fn get(&self, provider: Provider, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(EncryptedFileStore::get(self, provider, key)?)
    }

    fn set(&self, provider: Provider, key: &str, value: &str) -> Result<(), CredentialError> {
        Ok(EncryptedFileStore::set(self, provider, key, value)?)
    }

    fn delete(&self, provider: Provider, key: &str) -> Result<(), CredentialError> {
        Ok(EncryptedFileStore::delete(self, provider, key)?)
    }

    fn backend_name(&self) -> &'static str {
        "encrypted-file"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    Auto,
    Keyring,
    File,
}

impl BackendPreference {
    pub fn from_env() -> Result<Self, CredentialError> {
        match env::var(BACKEND_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(BackendPreference::Auto),
        }
    }

    fn parse(value: &str) -> Result<Self, CredentialError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendPreference::Auto),
            "keyring" => Ok(BackendPreference::Keyring),
            "file" | "encrypted-file" => Ok(BackendPreference::File),
            _ => Err(CredentialError::InvalidBackend(value.to_string())),
        }
    }
}

/// Picks the credential backend at startup: the system keyring when it
/// responds, otherwise the encrypted file.
pub fn select_credential_store(
    preference: BackendPreference,
) -> Result<Arc<dyn CredentialStore>, CredentialError> {
    let use_keyring = match preference {
        BackendPreference::Keyring => true,
        BackendPreference::File => false,
        BackendPreference::Auto => KeyringCredentialStore::probe(),
    };
    if use_keyring {
        tracing::debug!("using system keyring for credentials");
        return Ok(Arc::new(KeyringCredentialStore));
    }
    tracing::debug!("using encrypted file for credentials");
    Ok(Arc::new(EncryptedFileStore::new_default()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_preference() {
        assert_eq!(
            BackendPreference::parse("auto").unwrap(),
            BackendPreference::Auto
        );
        assert_eq!(
            BackendPreference::parse(" Keyring ").unwrap(),
            BackendPreference::Keyring
        );
        assert_eq!(
            BackendPreference::parse("encrypted-file").unwrap(),
            BackendPreference::File
        );
        assert!(matches!(
            BackendPreference::parse("vault"),
            Err(CredentialError::InvalidBackend(_))
        ));
    }

    #[test]
    fn file_store_is_usable_through_the_trait() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store: Box<dyn CredentialStore> =
            Box::new(EncryptedFileStore::in_dir(temp_dir.path()).unwrap());

        store.set(Provider::Todoist, "api_token", "t0k").unwrap();
        assert_eq!(
            store.get(Provider::Todoist, "api_token").unwrap().as_deref(),
            Some("t0k")
        );
        store.delete(Provider::Todoist, "api_token").unwrap();
        store.delete(Provider::Todoist, "api_token").unwrap();
        assert_eq!(store.backend_name(), "encrypted-file");
    }
}
