mod credential_store;
mod encrypted_file_store;

pub use credential_store::{
    BackendPreference, CredentialError, CredentialStore, KeyringCredentialStore,
    select_credential_store,
};
pub use encrypted_file_store::{EncryptedFileError, EncryptedFileStore};
