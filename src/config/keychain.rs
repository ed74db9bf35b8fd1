//! Keychain Integration
//!
//! Stored remote passwords live in the system keychain; the remotes file
//! only carries the keychain id. Uses the `keyring` crate.

use keyring::Entry;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.oxideterm.remote";

/// Keychain errors
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Secret not found for ID: {0}")]
    NotFound(String),
}

/// Where stored secrets are kept
pub trait SecretStore: Send + Sync {
    fn store(&self, id: &str, secret: &str) -> Result<(), KeychainError>;
    fn get(&self, id: &str) -> Result<String, KeychainError>;
    /// Deleting a missing entry is not an error
    fn delete(&self, id: &str) -> Result<(), KeychainError>;
}

/// Keychain id for a remote's stored password
pub fn password_keychain_id(remote_id: &str) -> String {
    format!("oxideterm-remote-{}", remote_id)
}

/// System keychain
pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    // username-prefixed account keeps the entry stable on macOS
    fn entry(&self, id: &str) -> Result<Entry, KeychainError> {
        let account = format!("{}@{}", whoami::username(), id);
        Ok(Entry::new(&self.service, &account)?)
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for Keychain {
    fn store(&self, id: &str, secret: &str) -> Result<(), KeychainError> {
        let entry = self.entry(id)?;
        entry.set_password(secret)?;
        // some backends accept the write and drop it
        match entry.get_password() {
            Ok(read_back) if read_back == secret => {
                tracing::info!("Keychain store verified: id={}", id);
                Ok(())
            }
            Ok(_) => {
                tracing::error!("Keychain store verification failed: content mismatch");
                Err(KeychainError::Keyring(keyring::Error::NoEntry))
            }
            Err(e) => {
                tracing::error!("Keychain store verification failed: {:?}", e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    fn get(&self, id: &str) -> Result<String, KeychainError> {
        match self.entry(id)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(id.to_string())),
            Err(e) => {
                tracing::error!("Keychain get failed: id={}, error={:?}", id, e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    fn delete(&self, id: &str) -> Result<(), KeychainError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }
}
