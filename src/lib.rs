//! OxideTerm Remote - remote shell sessions
//!
//! Launches shell peers (local subprocesses or over SSH), routes the packet
//! protocol they speak, enforces host-key trust and keeps the remote shell
//! state synchronized with the local side.

pub mod config;
pub mod interaction;
pub mod remote;
pub mod shell;
pub mod ssh;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{ConfigStorage, RemoteSettings, RemoteStore, SecretStore};
use interaction::UserInputBus;
use remote::{RemoteDirectory, RemoteError};

/// Initialize logging
pub fn init_logging() {
    // a subscriber may already be installed by the host application
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Services the host application holds for the lifetime of the process.
pub struct RemoteCore {
    pub directory: Arc<RemoteDirectory>,
    /// Prompts and alerts raised while connecting; the UI subscribes here
    pub interaction: Arc<UserInputBus>,
}

impl RemoteCore {
    /// Load remotes from the default config file and start auto-connects.
    pub async fn start(settings: RemoteSettings) -> Result<Self, RemoteError> {
        let storage = ConfigStorage::new()?;
        Self::start_with_store(settings, &storage, storage.secrets()).await
    }

    pub async fn start_with_store(
        settings: RemoteSettings,
        store: &dyn RemoteStore,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self, RemoteError> {
        tracing::info!("Starting OxideTerm remote core...");
        let interaction = Arc::new(UserInputBus::new());
        let directory = Arc::new(RemoteDirectory::with_default_launcher(
            Arc::new(settings),
            interaction.clone(),
            secrets,
        ));
        directory.load_all(store).await?;
        tracing::info!("Remote core ready ({} remotes)", directory.len());
        Ok(Self {
            directory,
            interaction,
        })
    }

    pub async fn shutdown(&self) {
        self.directory.reset().await;
    }
}
