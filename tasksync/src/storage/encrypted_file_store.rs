use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::Provider;

const STORAGE_DIR: &str = "tasksync";
const CREDENTIALS_FILENAME: &str = "credentials.bin";
const KEY_FILENAME: &str = "credentials.key";
const FILE_MAGIC: &[u8; 4] = b"TSCR";
const FILE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EncryptedFileError {
    #[error("data directory unavailable for credential storage")]
    MissingDataDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("key file {0} is malformed")]
    BadKeyFile(PathBuf),
}

/// Credentials kept in a single ChaCha20-Poly1305 encrypted file.
///
/// The file layout is `magic | version | nonce | u32 BE length | ciphertext`;
/// the plaintext is a JSON object keyed by `provider/key`. The cipher key is
/// derived from a random secret written once to a 0600 key file beside it.
///
/// The key file sits in the same directory as the ciphertext and is not
/// protected by anything else, so this only keeps tokens out of plain sight
/// at rest. Anyone who can read the directory can read the tokens. Prefer the
/// keyring backend wherever a secret service is available.
pub struct EncryptedFileStore {
    key: [u8; KEY_LEN],
    cipher_path: PathBuf,
    lock: Mutex<()>,
}

impl EncryptedFileStore {
    pub fn new_default() -> Result<Self, EncryptedFileError> {
        let mut dir = dirs::data_dir().ok_or(EncryptedFileError::MissingDataDir)?;
        dir.push(STORAGE_DIR);
        Self::in_dir(&dir)
    }

    pub fn in_dir(dir: &Path) -> Result<Self, EncryptedFileError> {
        fs::create_dir_all(dir)?;
        let secret = load_or_create_secret(&dir.join(KEY_FILENAME))?;
        Ok(Self {
            key: derive_key(&secret),
            cipher_path: dir.join(CREDENTIALS_FILENAME),
            lock: Mutex::new(()),
        })
    }

    pub fn get(&self, provider: Provider, key: &str) -> Result<Option<String>, EncryptedFileError> {
        let _guard = self.guard();
        Ok(self.read_all()?.remove(&entry_name(provider, key)))
    }

    pub fn set(&self, provider: Provider, key: &str, value: &str) -> Result<(), EncryptedFileError> {
        let _guard = self.guard();
        let mut entries = self.read_all()?;
        entries.insert(entry_name(provider, key), value.to_string());
        self.write_all(&entries)
    }

    pub fn delete(&self, provider: Provider, key: &str) -> Result<(), EncryptedFileError> {
        let _guard = self.guard();
        let mut entries = self.read_all()?;
        if entries.remove(&entry_name(provider, key)).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, EncryptedFileError> {
        if !self.cipher_path.exists() {
            return Ok(BTreeMap::new());
        }

        let mut data = Vec::new();
        let mut file = OpenOptions::new().read(true).open(&self.cipher_path)?;
        file.read_to_end(&mut data)?;

        let header_len = FILE_MAGIC.len() + 1 + NONCE_LEN + std::mem::size_of::<u32>();
        if data.len() < header_len
            || &data[..FILE_MAGIC.len()] != FILE_MAGIC
            || data[FILE_MAGIC.len()] != FILE_VERSION
        {
            return Err(EncryptedFileError::Decryption);
        }

        let nonce_start = FILE_MAGIC.len() + 1;
        let nonce_end = nonce_start + NONCE_LEN;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[nonce_end..header_len]);
        let ciphertext_len = u32::from_be_bytes(len_bytes) as usize;
        if data.len() < header_len + ciphertext_len {
            return Err(EncryptedFileError::Decryption);
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&data[nonce_start..nonce_end]),
                &data[header_len..header_len + ciphertext_len],
            )
            .map_err(|_| EncryptedFileError::Decryption)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), EncryptedFileError> {
        let plaintext = serde_json::to_vec(entries)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| EncryptedFileError::Encryption)?;

        let mut payload = Vec::with_capacity(
            FILE_MAGIC.len() + 1 + NONCE_LEN + std::mem::size_of::<u32>() + ciphertext.len(),
        );
        payload.extend_from_slice(FILE_MAGIC);
        payload.push(FILE_VERSION);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        payload.extend_from_slice(&ciphertext);

        write_private(&self.cipher_path, &payload)
    }
}

fn entry_name(provider: Provider, key: &str) -> String {
    format!("{}/{key}", provider.as_str())
}

fn load_or_create_secret(path: &Path) -> Result<[u8; KEY_LEN], EncryptedFileError> {
    if path.exists() {
        let bytes = fs::read(path)?;
        return bytes
            .try_into()
            .map_err(|_| EncryptedFileError::BadKeyFile(path.to_path_buf()));
    }
    let mut secret = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut secret);
    write_private(path, &secret)?;
    Ok(secret)
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<(), EncryptedFileError> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn derive_key(secret: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let digest = Sha256::digest(secret);
    key.copy_from_slice(&digest);
    key
}
