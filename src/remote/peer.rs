//! Peer Launch
//!
//! A peer is any process speaking the packet protocol on its stdio. Local
//! remotes spawn the peer binary directly; ssh remotes run the peer command
//! over an exec channel, and a pump task bridges the channel to in-memory
//! pipes so the connection sees the same byte streams either way.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use russh::ChannelMsg;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::RemoteError;
use crate::config::{RemoteDefinition, RemoteKind, RemoteSettings, SecretStore};
use crate::interaction::UserInteraction;
use crate::ssh::{SshNegotiator, SshTransport};

/// Exit code when the peer reported one, or a description of how it ended
pub type PeerExit = Result<Option<i32>, String>;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A running peer's streams and lifetime.
pub struct PeerProcess {
    /// Peer stdout (packets)
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Peer stdin
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Resolves when the peer terminates
    pub exit: BoxFuture<'static, PeerExit>,
    /// Cancel to stop the peer
    pub kill: CancellationToken,
}

#[async_trait]
pub trait PeerLauncher: Send + Sync {
    async fn launch(&self, remote: &RemoteDefinition) -> Result<PeerProcess, RemoteError>;
}

/// Launches local peers as subprocesses and ssh peers over exec channels.
pub struct DefaultPeerLauncher {
    settings: Arc<RemoteSettings>,
    negotiator: SshNegotiator,
}

impl DefaultPeerLauncher {
    pub fn new(settings: Arc<RemoteSettings>, interaction: Arc<dyn UserInteraction>) -> Self {
        Self {
            negotiator: SshNegotiator::new(settings.clone(), interaction),
            settings,
        }
    }

    /// Keychain consulted for stored ssh passwords.
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.negotiator = self.negotiator.with_secrets(secrets);
        self
    }

    fn launch_local(&self, remote: &RemoteDefinition) -> Result<PeerProcess, RemoteError> {
        let path = &self.settings.local_peer_path;
        let mut cmd = tokio::process::Command::new(path);
        cmd.args(&self.settings.local_peer_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(home) = dirs::home_dir() {
            cmd.current_dir(home);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RemoteError::Launch(format!("{}: {}", path.display(), e)))?;
        info!(
            "[remote] Spawned local peer for '{}' (pid {:?})",
            remote.name,
            child.id()
        );

        let missing = |stream: &str| RemoteError::Launch(format!("peer {} not captured", stream));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let kill = CancellationToken::new();
        let token = kill.clone();
        let exit = async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            match status {
                Some(Ok(status)) => Ok(status.code()),
                Some(Err(e)) => Err(e.to_string()),
                None => {
                    if let Err(e) = child.kill().await {
                        debug!("[remote] kill local peer: {}", e);
                    }
                    Ok(None)
                }
            }
        }
        .boxed();

        Ok(PeerProcess {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            stderr: Some(Box::new(stderr)),
            exit,
            kill,
        })
    }

    async fn launch_ssh(&self, remote: &RemoteDefinition) -> Result<PeerProcess, RemoteError> {
        let transport = self.negotiator.connect(remote, &remote.name).await?;
        let channel = transport.exec(&self.settings.remote_peer_command).await?;
        info!(
            "[remote] Started peer on {} ({})",
            remote.display_target(),
            self.settings.remote_peer_command
        );

        let (core_io, pump_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (core_err, pump_err) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(core_io);
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();

        tokio::spawn(pump_channel(
            transport,
            channel,
            pump_io,
            pump_err,
            kill.clone(),
            exit_tx,
            remote.name.clone(),
        ));

        let exit = async move {
            exit_rx
                .await
                .unwrap_or_else(|_| Err("ssh channel pump ended".to_string()))
        }
        .boxed();

        Ok(PeerProcess {
            reader: Box::new(reader),
            writer: Box::new(writer),
            stderr: Some(Box::new(core_err)),
            exit,
            kill,
        })
    }
}

#[async_trait]
impl PeerLauncher for DefaultPeerLauncher {
    async fn launch(&self, remote: &RemoteDefinition) -> Result<PeerProcess, RemoteError> {
        match remote.kind {
            RemoteKind::Local => self.launch_local(remote),
            RemoteKind::Ssh => self.launch_ssh(remote).await,
        }
    }
}

/// Owns the transport and channel until the peer ends.
async fn pump_channel(
    transport: SshTransport,
    mut channel: russh::Channel<russh::client::Msg>,
    pipe: tokio::io::DuplexStream,
    mut stderr: tokio::io::DuplexStream,
    kill: CancellationToken,
    exit_tx: oneshot::Sender<PeerExit>,
    name: String,
) {
    let (mut from_core, mut to_core) = tokio::io::split(pipe);
    let mut buf = vec![0u8; 8192];
    let mut input_open = true;
    let mut exit_code: Option<i32> = None;

    let result: PeerExit = loop {
        tokio::select! {
            _ = kill.cancelled() => {
                let _ = channel.close().await;
                break Ok(exit_code);
            }

            n = from_core.read(&mut buf), if input_open => {
                match n {
                    Ok(0) | Err(_) => {
                        input_open = false;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        if let Err(e) = channel.data(&buf[..n]).await {
                            break Err(format!("channel write: {}", e));
                        }
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if to_core.write_all(&data).await.is_err() {
                            break Ok(exit_code);
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            let _ = stderr.write_all(&data).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        break Err(format!("peer killed by signal {:?}", signal_name));
                    }
                    Some(ChannelMsg::Eof) => {
                        debug!("[remote] ssh peer '{}' sent EOF", name);
                    }
                    Some(ChannelMsg::Close) | None => break Ok(exit_code),
                    Some(_) => {}
                }
            }
        }
    };

    let _ = to_core.shutdown().await;
    let _ = stderr.shutdown().await;
    transport.disconnect().await;
    match &result {
        Ok(code) => info!("[remote] ssh peer '{}' ended (exit {:?})", name, code),
        Err(e) => warn!("[remote] ssh peer '{}' ended: {}", name, e),
    }
    let _ = exit_tx.send(result);
}
