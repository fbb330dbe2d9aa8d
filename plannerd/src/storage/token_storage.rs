use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SERVICE_NAME: &str = "planner.sync";
const TOKEN_KEY: &str = "google_access_token";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("token not found")]
    TokenNotFound,
    #[error("stored credential is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Access token plus its expiry (unix seconds), as kept in the OS keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl StoredCredential {
    pub fn new(access_token: impl Into<String>, expires_at: Option<i64>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// Keyring entries written by hand may hold the bare token.
    fn decode(secret: &str) -> Result<Self, StorageError> {
        let secret = secret.trim();
        if secret.starts_with('{') {
            return Ok(serde_json::from_str(secret)?);
        }
        Ok(Self::new(secret, None))
    }
}

pub struct TokenStorage {
    entry: Entry,
}

impl TokenStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            entry: Entry::new(SERVICE_NAME, TOKEN_KEY)?,
        })
    }

    pub fn save(&self, credential: &StoredCredential) -> Result<(), StorageError> {
        let secret = serde_json::to_string(credential)?;
        self.entry.set_password(&secret)?;
        Ok(())
    }

    pub fn load(&self) -> Result<StoredCredential, StorageError> {
        match self.entry.get_password() {
            Ok(secret) => StoredCredential::decode(&secret),
            Err(keyring::Error::NoEntry) => Err(StorageError::TokenNotFound),
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }

    pub fn delete(&self) -> Result<(), StorageError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }
}
