//! At-rest sealing for queued request headers, which routinely carry
//! bearer tokens. The master key lives in the OS keychain.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use keyring::Entry;
use rand::RngCore;
use thiserror::Error;

const SERVICE_NAME: &str = "offline-outbox";
const MASTER_KEY_NAME: &str = "header-sealing-key";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const SEALED_PREFIX: &str = "sealed:v1:";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Sealing failed")]
    Seal,

    #[error("Unsealing failed")]
    Open,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Clone)]
pub struct HeaderCipher {
    cipher: Aes256Gcm,
}

impl HeaderCipher {
    /// Use the keychain master key, generating and storing one on first use.
    pub fn from_keychain() -> Result<Self, CryptoError> {
        let key = Self::load_or_create_key()?;
        Self::from_key(&key)
    }

    pub fn from_key(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    fn load_or_create_key() -> Result<[u8; KEY_SIZE], CryptoError> {
        let entry = Entry::new(SERVICE_NAME, MASTER_KEY_NAME)?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = BASE64.decode(&encoded)?;
                let key: [u8; KEY_SIZE] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                tracing::info!("Loaded header sealing key from keychain");
                Ok(key)
            }
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; KEY_SIZE];
                OsRng.fill_bytes(&mut key);
                entry.set_password(&BASE64.encode(key))?;
                tracing::info!("Generated header sealing key and stored it in keychain");
                Ok(key)
            }
            Err(e) => Err(CryptoError::Keyring(e)),
        }
    }

    pub fn is_sealed(stored: &str) -> bool {
        stored.starts_with(SEALED_PREFIX)
    }

    /// `sealed:v1:` followed by base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Seal)?;

        let mut packed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", SEALED_PREFIX, BASE64.encode(&packed)))
    }

    pub fn open(&self, stored: &str) -> Result<String, CryptoError> {
        let encoded = stored.strip_prefix(SEALED_PREFIX).ok_or(CryptoError::Open)?;
        let packed = BASE64.decode(encoded)?;
        if packed.len() < NONCE_SIZE {
            return Err(CryptoError::Open);
        }

        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Open)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Open)
    }
}
