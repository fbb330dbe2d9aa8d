use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no stored credential")]
    Missing,
    #[error("credential expired and interactive consent is required")]
    ConsentRequired,
    #[error("credential storage error: {0}")]
    Storage(String),
}

/// Source of access tokens for every remote call.
///
/// `ensure_valid` may do I/O (load from a secret store, check expiry) and fails when the
/// user has to grant access again. `current` returns the token to attach to a request.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn ensure_valid(&self) -> Result<bool, CredentialError>;

    fn current(&self) -> Result<String, CredentialError>;
}

/// Fixed token, used for tokens supplied through the environment and in tests.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn ensure_valid(&self) -> Result<bool, CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(true)
    }

    fn current(&self) -> Result<String, CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(self.token.clone())
    }
}
