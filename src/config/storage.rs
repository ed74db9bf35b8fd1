//! Configuration Storage
//!
//! Handles reading/writing the remotes file.
//! Config location: ~/.oxideterm on macOS/Linux, %APPDATA%\OxideTerm on Windows
//! Stored passwords go to the keychain; the file keeps only their ids.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::keychain::{password_keychain_id, Keychain, KeychainError, SecretStore};
use super::types::{RemoteDefinition, RemotesFile, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Duplicate remote {kind} '{value}'")]
    Duplicate { kind: &'static str, value: String },

    #[error(transparent)]
    Keychain(#[from] KeychainError),
}

/// Get the OxideTerm configuration directory
/// Returns %APPDATA%\OxideTerm on Windows, ~/.oxideterm on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the remotes file path
pub fn remotes_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("remotes.json"))
}

/// Source of remote definitions consumed by the session directory.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<RemoteDefinition>, StorageError>;
}

/// JSON file backed remote storage
pub struct ConfigStorage {
    path: PathBuf,
    secrets: Arc<dyn SecretStore>,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(remotes_file()?))
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            secrets: Arc::new(Keychain::new()),
        }
    }

    /// Replace the keychain used for stored passwords.
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn secrets(&self) -> Arc<dyn SecretStore> {
        self.secrets.clone()
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load the remotes file.
    /// Missing file yields an empty document; a corrupted file is backed up
    /// and replaced by an empty document.
    pub async fn load(&self) -> Result<RemotesFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RemotesFile::default())
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<RemotesFile>(&contents) {
            Ok(file) => {
                if file.version > CONFIG_VERSION {
                    return Err(StorageError::VersionTooNew {
                        found: file.version,
                        supported: CONFIG_VERSION,
                    });
                }
                validate_remotes(&file.remotes)?;
                Ok(file)
            }
            Err(e) => {
                tracing::warn!("Remotes file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted remotes file backed up to {:?}, using defaults",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted remotes file: {}", backup_err)
                    }
                }
                Ok(RemotesFile::default())
            }
        }
    }

    /// Save the remotes file (temp file + rename).
    /// In-memory passwords are written to the keychain first.
    pub async fn save(&self, file: &RemotesFile) -> Result<(), StorageError> {
        validate_remotes(&file.remotes)?;
        self.ensure_dir().await?;

        let mut file = file.clone();
        for remote in &mut file.remotes {
            if let Some(password) = &remote.password {
                let id = remote
                    .password_keychain_id
                    .clone()
                    .unwrap_or_else(|| password_keychain_id(&remote.remote_id));
                self.secrets.store(&id, password)?;
                remote.password_keychain_id = Some(id);
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&file)?;

        let mut out = fs::File::create(&temp_path).await?;
        out.write_all(json.as_bytes()).await?;
        out.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Drop a remote's stored password from the keychain.
    pub fn forget_password(&self, remote: &mut RemoteDefinition) -> Result<(), StorageError> {
        remote.password = None;
        if let Some(id) = remote.password_keychain_id.take() {
            self.secrets.delete(&id)?;
        }
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current file next to itself with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[async_trait]
impl RemoteStore for ConfigStorage {
    async fn load_all(&self) -> Result<Vec<RemoteDefinition>, StorageError> {
        Ok(self.load().await?.remotes)
    }
}

/// Remote ids and display names must be unique.
pub fn validate_remotes(remotes: &[RemoteDefinition]) -> Result<(), StorageError> {
    let mut ids = std::collections::HashSet::new();
    let mut names = std::collections::HashSet::new();
    for remote in remotes {
        if !ids.insert(remote.remote_id.as_str()) {
            return Err(StorageError::Duplicate {
                kind: "id",
                value: remote.remote_id.clone(),
            });
        }
        if !names.insert(remote.name.as_str()) {
            return Err(StorageError::Duplicate {
                kind: "name",
                value: remote.name.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keychain::testing::MemorySecretStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("remotes.json"));

        let file = storage.load().await.unwrap();
        assert_eq!(file.version, CONFIG_VERSION);
        assert!(file.remotes.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_all() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("remotes.json"));

        let mut file = RemotesFile::default();
        file.remotes.push(RemoteDefinition::local("local-1", "local"));
        file.remotes
            .push(RemoteDefinition::ssh("ssh-1", "prod", "prod.example.com"));
        storage.save(&file).await.unwrap();

        let remotes = storage.load_all().await.unwrap();
        assert_eq!(remotes.len(), 2);
        assert_eq!(remotes[1].host, "prod.example.com");
    }

    #[tokio::test]
    async fn test_corrupted_file_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("remotes.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let storage = ConfigStorage::with_path(path);
        let file = storage.load().await.unwrap();
        assert!(file.remotes.is_empty());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_version_too_new() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("remotes.json");
        tokio::fs::write(&path, r#"{"version": 99, "remotes": []}"#)
            .await
            .unwrap();

        let err = ConfigStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTooNew { found: 99, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("remotes.json"));

        let mut file = RemotesFile::default();
        file.remotes.push(RemoteDefinition::local("a", "same"));
        file.remotes.push(RemoteDefinition::local("b", "same"));
        assert!(matches!(
            storage.save(&file).await,
            Err(StorageError::Duplicate { kind: "name", .. })
        ));
    }

    #[tokio::test]
    async fn test_password_goes_to_keychain_not_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("remotes.json");
        let secrets = Arc::new(MemorySecretStore::new());
        let storage = ConfigStorage::with_path(path.clone()).with_secrets(secrets.clone());

        let mut def = RemoteDefinition::ssh("ssh-1", "prod", "prod.example.com");
        def.password = Some("hunter2".into());
        let mut file = RemotesFile::default();
        file.remotes.push(def);
        storage.save(&file).await.unwrap();

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!on_disk.contains("hunter2"));

        let loaded = storage.load().await.unwrap();
        let id = loaded.remotes[0].password_keychain_id.clone().unwrap();
        assert_eq!(id, password_keychain_id("ssh-1"));
        assert!(loaded.remotes[0].password.is_none());
        assert_eq!(secrets.get(&id).unwrap(), "hunter2");

        let mut remote = loaded.remotes[0].clone();
        storage.forget_password(&mut remote).unwrap();
        assert!(remote.password_keychain_id.is_none());
        assert!(matches!(secrets.get(&id), Err(KeychainError::NotFound(_))));
    }
}
