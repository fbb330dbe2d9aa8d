use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use planner_core::{CredentialError, CredentialProvider};

use crate::storage::{StorageError, StoredCredential, TokenStorage};

/// Keyring-backed credential source. Tokens are loaded lazily and never refreshed here:
/// an expired token means the user has to grant access again.
pub struct TokenProvider {
    storage: Option<TokenStorage>,
    state: Mutex<Option<StoredCredential>>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(storage: TokenStorage) -> Self {
        Self {
            storage: Some(storage),
            state: Mutex::new(None),
            refresh_skew_secs: 60,
        }
    }

    pub fn from_credential(credential: StoredCredential) -> Self {
        Self {
            storage: None,
            state: Mutex::new(Some(credential)),
            refresh_skew_secs: 60,
        }
    }

    fn should_refresh(&self, credential: &StoredCredential) -> bool {
        let Some(expires_at) = credential.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    fn load(&self) -> Result<StoredCredential, CredentialError> {
        let storage = self.storage.as_ref().ok_or(CredentialError::Missing)?;
        storage.load().map_err(|err| match err {
            StorageError::TokenNotFound => CredentialError::Missing,
            other => CredentialError::Storage(other.to_string()),
        })
    }
}

#[async_trait]
impl CredentialProvider for TokenProvider {
    async fn ensure_valid(&self) -> Result<bool, CredentialError> {
        let cached = self
            .state
            .lock()
            .map_err(|_| CredentialError::Storage("token state poisoned".into()))?
            .clone();
        let credential = match cached {
            Some(credential) => credential,
            None => {
                let loaded = self.load()?;
                if let Ok(mut state) = self.state.lock() {
                    *state = Some(loaded.clone());
                }
                loaded
            }
        };
        if credential.access_token.is_empty() {
            return Err(CredentialError::Missing);
        }
        if self.should_refresh(&credential) {
            return Err(CredentialError::ConsentRequired);
        }
        Ok(true)
    }

    fn current(&self) -> Result<String, CredentialError> {
        self.state
            .lock()
            .map_err(|_| CredentialError::Storage("token state poisoned".into()))?
            .as_ref()
            .map(|credential| credential.access_token.clone())
            .ok_or(CredentialError::Missing)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_token_is_served() {
        let provider =
            TokenProvider::from_credential(StoredCredential::new("abc", Some(now_unix() + 3600)));
        assert!(provider.ensure_valid().await.unwrap());
        assert_eq!(provider.current().unwrap(), "abc");
    }

    #[tokio::test]
    async fn token_inside_skew_requires_consent() {
        let provider =
            TokenProvider::from_credential(StoredCredential::new("abc", Some(now_unix() + 30)));
        assert!(matches!(
            provider.ensure_valid().await,
            Err(CredentialError::ConsentRequired)
        ));
    }

    #[tokio::test]
    async fn token_without_expiry_never_expires() {
        let provider = TokenProvider::from_credential(StoredCredential::new("abc", None));
        assert!(provider.ensure_valid().await.unwrap());
    }

    #[tokio::test]
    async fn empty_token_is_missing() {
        let provider = TokenProvider::from_credential(StoredCredential::new("", None));
        assert!(matches!(
            provider.ensure_valid().await,
            Err(CredentialError::Missing)
        ));
    }
}
