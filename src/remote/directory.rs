//! Session Directory
//!
//! Every known remote definition and its live [`Connection`], looked up by
//! id or display name. Constructed once at startup and handed to whoever
//! needs it. The map has its own lock; lookups never wait on a
//! connection's activity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::connection::{CommandSpec, Connection, PeerEvent};
use super::context::CallContext;
use super::error::RemoteError;
use super::packet::{CmdStartPacket, Packet, ResponsePacket};
use super::peer::{DefaultPeerLauncher, PeerLauncher};
use super::status::RemoteStatus;
use crate::config::{validate_remotes, RemoteSettings, RemoteStore, SecretStore};
use crate::interaction::UserInteraction;

const EVENT_CAPACITY: usize = 1024;

pub struct RemoteDirectory {
    settings: Arc<RemoteSettings>,
    launcher: Arc<dyn PeerLauncher>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    events: broadcast::Sender<PeerEvent>,
    auto_connects: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteDirectory {
    pub fn new(settings: Arc<RemoteSettings>, launcher: Arc<dyn PeerLauncher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            launcher,
            connections: Mutex::new(HashMap::new()),
            events,
            auto_connects: Mutex::new(Vec::new()),
        }
    }

    /// Directory launching real peers (subprocess or ssh exec).
    pub fn with_default_launcher(
        settings: Arc<RemoteSettings>,
        interaction: Arc<dyn UserInteraction>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let launcher =
            Arc::new(DefaultPeerLauncher::new(settings.clone(), interaction).with_secrets(secrets));
        Self::new(settings, launcher)
    }

    /// Auto-connect launches not yet joined
    pub fn pending_auto_connects(&self) -> usize {
        self.auto_connects.lock().len()
    }

    /// Replace the directory's contents with the store's definitions and
    /// start every auto-connect remote in the background.
    pub async fn load_all(&self, store: &dyn RemoteStore) -> Result<(), RemoteError> {
        let remotes = store.load_all().await?;
        validate_remotes(&remotes)?;

        let previous = {
            let mut connections = self.connections.lock();
            let previous: Vec<_> = connections.drain().map(|(_, conn)| conn).collect();
            for remote in remotes {
                let conn = Connection::new(
                    remote,
                    self.settings.clone(),
                    self.launcher.clone(),
                    self.events.clone(),
                );
                connections.insert(conn.remote_id().to_string(), conn);
            }
            info!("[remote] Loaded {} remote definitions", connections.len());
            previous
        };
        for conn in previous {
            conn.disconnect();
        }

        let auto: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .values()
            .filter(|c| c.remote().auto_connect)
            .cloned()
            .collect();
        let mut auto_connects = self.auto_connects.lock();
        auto_connects.retain(|task| !task.is_finished());
        for conn in auto {
            auto_connects.push(tokio::spawn(async move {
                info!("[remote] Auto-connecting '{}'", conn.remote().name);
                if let Err(e) = conn.launch().await {
                    warn!("[remote] Auto-connect of '{}' failed: {}", conn.remote().name, e);
                }
            }));
        }
        Ok(())
    }

    /// Join the auto-connect launches started by `load_all`.
    pub async fn wait_auto_connects(&self) {
        let tasks = std::mem::take(&mut *self.auto_connects.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn get_by_id(&self, remote_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().get(remote_id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .values()
            .find(|c| c.remote().name == name)
            .cloned()
    }

    fn require(&self, remote_id: &str) -> Result<Arc<Connection>, RemoteError> {
        self.get_by_id(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))
    }

    /// One row per remote, sorted by display name.
    pub fn list_statuses(&self) -> Vec<RemoteStatus> {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().values().cloned().collect();
        let mut rows: Vec<RemoteStatus> = connections.iter().map(|c| c.status_snapshot()).collect();
        rows.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
        rows
    }

    pub async fn launch(&self, remote_id: &str) -> Result<(), RemoteError> {
        self.require(remote_id)?.launch().await
    }

    pub fn is_connected(&self, remote_id: &str) -> bool {
        self.get_by_id(remote_id)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub async fn run_command(
        &self,
        ctx: &CallContext,
        remote_id: &str,
        spec: CommandSpec,
    ) -> Result<CmdStartPacket, RemoteError> {
        self.require(remote_id)?.run_command(ctx, spec).await
    }

    pub async fn packet_rpc(
        &self,
        ctx: &CallContext,
        remote_id: &str,
        packet: Packet,
    ) -> Result<ResponsePacket, RemoteError> {
        self.require(remote_id)?.packet_rpc(ctx, packet).await
    }

    pub fn disconnect(&self, remote_id: &str) -> Result<(), RemoteError> {
        self.require(remote_id)?.disconnect();
        Ok(())
    }

    /// Disconnect everything and forget all definitions.
    pub async fn reset(&self) {
        for task in std::mem::take(&mut *self.auto_connects.lock()) {
            task.abort();
        }
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in &connections {
            conn.disconnect();
        }
        for conn in &connections {
            conn.wait_stopped().await;
        }
        info!("[remote] Directory reset ({} connections closed)", connections.len());
    }

    /// Packets from every connection that were not replies.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{ConfigStorage, RemoteDefinition, RemotesFile, StorageError};
    use crate::remote::peer::testing::PipeLauncher;
    use crate::remote::status::Status;

    struct FixedStore(Vec<RemoteDefinition>);

    #[async_trait]
    impl RemoteStore for FixedStore {
        async fn load_all(&self) -> Result<Vec<RemoteDefinition>, StorageError> {
            Ok(self.0.clone())
        }
    }

    fn directory(launcher: Arc<PipeLauncher>) -> RemoteDirectory {
        RemoteDirectory::new(Arc::new(RemoteSettings::default()), launcher)
    }

    #[tokio::test]
    async fn test_lookup_and_statuses() {
        let (launcher, _sides) = PipeLauncher::new();
        let dir = directory(launcher.clone());
        let store = FixedStore(vec![
            RemoteDefinition::ssh("id-web", "web", "web.example.com"),
            RemoteDefinition::local("id-local", "alpha"),
        ]);
        dir.load_all(&store).await.unwrap();

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.get_by_name("web").unwrap().remote_id(), "id-web");
        assert_eq!(dir.get_by_id("id-local").unwrap().remote().name, "alpha");
        assert!(dir.get_by_name("missing").is_none());

        let rows = dir.list_statuses();
        let names: Vec<&str> = rows.iter().map(|r| r.remote_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "web"]);
        assert!(rows.iter().all(|r| r.status == Status::Init && r.default_cwd.is_none()));
        assert!(!dir.is_connected("id-web"));
        assert_eq!(launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_remote() {
        let (launcher, _sides) = PipeLauncher::new();
        let dir = directory(launcher);
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let err = dir
            .run_command(&ctx, "nope", CommandSpec::new("s", "ls"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
        assert!(!dir.is_connected("nope"));
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let (launcher, _sides) = PipeLauncher::new();
        let dir = directory(launcher);
        let store = FixedStore(vec![
            RemoteDefinition::local("a", "same"),
            RemoteDefinition::local("b", "same"),
        ]);
        assert!(matches!(
            dir.load_all(&store).await,
            Err(RemoteError::Storage(StorageError::Duplicate { .. }))
        ));
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_auto_connect_and_run() {
        let (launcher, mut sides) = PipeLauncher::new();
        let dir = directory(launcher);
        let mut auto = RemoteDefinition::local("id-a", "auto");
        auto.auto_connect = true;
        let store = FixedStore(vec![auto, RemoteDefinition::local("id-m", "manual")]);
        dir.load_all(&store).await.unwrap();

        let mut side = sides.recv().await.unwrap();
        side.send_init("/srv").await;
        dir.wait_auto_connects().await;
        assert!(dir.is_connected("id-a"));
        assert!(!dir.is_connected("id-m"));

        let rows = dir.list_statuses();
        assert_eq!(rows[0].remote_name, "auto");
        assert_eq!(rows[0].default_cwd.as_deref(), Some("/srv"));

        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let run = {
            let spec = CommandSpec::new("s1", "uptime");
            async { dir.run_command(&ctx, "id-a", spec).await }
        };
        let peer = async {
            let req = side.recv().await;
            let req_id = req.req_id().unwrap().to_string();
            side.send(&Packet::Response(ResponsePacket::err(req_id, "no tty")))
                .await;
        };
        let (result, ()) = tokio::join!(run, peer);
        assert_eq!(result.unwrap_err().to_string(), "no tty");

        let not_connected = dir
            .run_command(&ctx, "id-m", CommandSpec::new("s1", "ls"))
            .await
            .unwrap_err();
        assert!(matches!(not_connected, RemoteError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_events_fan_out_across_connections() {
        let (launcher, mut sides) = PipeLauncher::new();
        let dir = directory(launcher);
        dir.load_all(&FixedStore(vec![RemoteDefinition::local("id-x", "x")]))
            .await
            .unwrap();
        let mut events = dir.subscribe();

        let launch = dir.launch("id-x");
        let peer = async {
            let mut side = sides.recv().await.unwrap();
            side.send_init("/").await;
            side
        };
        let (launched, mut side) = tokio::join!(launch, peer);
        launched.unwrap();

        side.send_line("not json").await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.remote_id, "id-x");
        assert_eq!(event.packet, Packet::raw("not json"));
    }

    #[tokio::test]
    async fn test_finished_auto_connects_are_pruned() {
        let (launcher, _sides) = PipeLauncher::new();
        let dir = directory(launcher.clone());
        let mut auto = RemoteDefinition::local("id-a", "auto");
        auto.auto_connect = true;
        let store = FixedStore(vec![auto]);

        for _ in 0..5 {
            launcher.fail_next();
            dir.load_all(&store).await.unwrap();
            while dir.get_by_id("id-a").unwrap().status() != Status::Error {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(launcher.launch_count(), 5);
        assert_eq!(dir.pending_auto_connects(), 1);
        dir.wait_auto_connects().await;
        assert_eq!(dir.pending_auto_connects(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_reset() {
        let (launcher, mut sides) = PipeLauncher::new();
        let dir = directory(launcher);
        dir.load_all(&FixedStore(vec![RemoteDefinition::local("id-x", "x")]))
            .await
            .unwrap();

        let (launched, side) = tokio::join!(dir.launch("id-x"), async {
            let mut side = sides.recv().await.unwrap();
            side.send_init("/").await;
            side
        });
        launched.unwrap();

        dir.disconnect("id-x").unwrap();
        assert!(!dir.is_connected("id-x"));
        assert_eq!(dir.get_by_id("id-x").unwrap().status(), Status::Disconnected);
        drop(side);

        dir.reset().await;
        assert!(dir.is_empty());
        assert!(dir.list_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_load_from_config_storage() {
        let temp = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("remotes.json"));
        let mut file = RemotesFile::default();
        file.remotes.push(RemoteDefinition::ssh("id-1", "db", "db.internal"));
        storage.save(&file).await.unwrap();

        let (launcher, _sides) = PipeLauncher::new();
        let dir = directory(launcher);
        dir.load_all(&storage).await.unwrap();
        assert_eq!(dir.get_by_name("db").unwrap().remote().host, "db.internal");
    }
}
