//! Connection
//!
//! One per remote definition. Owns the peer's lifetime, the packet stream
//! and the outstanding-request registry.
//!
//! # Tasks per launch
//!
//! ```text
//! reader  : peer stdout  -> inbound   (decode_line)
//! stderr  : peer stderr  -> inbound   (raw packets)
//! writer  : outbound     -> peer stdin
//! exit    : peer exit    -> status Connected -> Disconnected
//! dispatch: inbound      -> registry (responses) | broadcast (everything else)
//! ```
//!
//! All mutable state sits behind one lock that is never held across an
//! await. Every task handle is kept so [`Connection::wait_stopped`] can join
//! them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::CallContext;
use super::error::RemoteError;
use super::packet::{
    decode_line, encode_line, CmdDonePacket, CmdStartPacket, CommandKey, InitPacket, Packet,
    ResponsePacket, RunPacket, TermOpts,
};
use super::peer::{PeerExit, PeerLauncher, PeerProcess};
use super::rpc::{OutstandingRequestRegistry, RpcError};
use super::status::{RemoteStatus, Status};
use crate::config::{RemoteDefinition, RemoteSettings};
use crate::shell::{apply, ShellState};

const PACKET_BUFFER: usize = 256;

/// Recent shell states kept besides the one from the handshake
const SHELL_STATE_HISTORY: usize = 8;

/// A packet the peer sent that was not a reply to a pending request
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub remote_id: String,
    pub packet: Packet,
}

/// What to run and where
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub session_id: String,
    /// Generated when absent
    pub cmd_id: Option<String>,
    /// Defaults to the peer's home directory
    pub cwd: Option<String>,
    pub command: String,
    /// `None` inherits the peer's environment
    pub env: Option<BTreeMap<String, String>>,
    /// Defaults to the configured terminal geometry
    pub term_opts: Option<TermOpts>,
}

impl CommandSpec {
    pub fn new(session_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            ..Default::default()
        }
    }
}

struct ConnState {
    status: Status,
    error: Option<String>,
    init: Option<InitPacket>,
    outbound: Option<mpsc::Sender<Packet>>,
    kill: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    /// Bumped per launch so a stale exit watcher cannot demote a newer peer
    generation: u64,
    shell_states: HashMap<String, ShellState>,
    /// Insertion order of `shell_states`, oldest first
    state_order: VecDeque<String>,
    init_state_hash: Option<String>,
    latest_state_hash: Option<String>,
}

impl ConnState {
    fn reset_shell_states(&mut self, initial: Option<&ShellState>) {
        self.shell_states.clear();
        self.state_order.clear();
        self.init_state_hash = initial.map(|s| s.hash.clone());
        self.latest_state_hash = None;
        if let Some(initial) = initial {
            self.remember_state(initial.clone());
        }
    }

    /// Make `next` the latest state and drop states no diff can still use.
    fn remember_state(&mut self, next: ShellState) {
        let hash = next.hash.clone();
        self.state_order.retain(|h| h != &hash);
        self.state_order.push_back(hash.clone());
        self.shell_states.insert(hash.clone(), next);
        self.latest_state_hash = Some(hash);

        let mut recent = 0;
        let mut keep = VecDeque::with_capacity(self.state_order.len());
        while let Some(h) = self.state_order.pop_back() {
            let pinned = self.init_state_hash.as_deref() == Some(h.as_str());
            if pinned || recent < SHELL_STATE_HISTORY {
                if !pinned {
                    recent += 1;
                }
                keep.push_front(h);
            } else {
                self.shell_states.remove(&h);
            }
        }
        self.state_order = keep;
    }
}

pub struct Connection {
    remote: RemoteDefinition,
    settings: Arc<RemoteSettings>,
    launcher: Arc<dyn PeerLauncher>,
    state: Mutex<ConnState>,
    registry: OutstandingRequestRegistry,
    events: broadcast::Sender<PeerEvent>,
}

impl Connection {
    pub fn new(
        remote: RemoteDefinition,
        settings: Arc<RemoteSettings>,
        launcher: Arc<dyn PeerLauncher>,
        events: broadcast::Sender<PeerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            settings,
            launcher,
            state: Mutex::new(ConnState {
                status: Status::Init,
                error: None,
                init: None,
                outbound: None,
                kill: None,
                tasks: Vec::new(),
                generation: 0,
                shell_states: HashMap::new(),
                state_order: VecDeque::new(),
                init_state_hash: None,
                latest_state_hash: None,
            }),
            registry: OutstandingRequestRegistry::new(),
            events,
        })
    }

    pub fn remote(&self) -> &RemoteDefinition {
        &self.remote
    }

    pub fn remote_id(&self) -> &str {
        &self.remote.remote_id
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().status == Status::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Peer identity from the handshake
    pub fn init_info(&self) -> Option<InitPacket> {
        self.state.lock().init.clone()
    }

    pub fn status_snapshot(&self) -> RemoteStatus {
        let state = self.state.lock();
        RemoteStatus {
            remote_id: self.remote.remote_id.clone(),
            remote_type: self.remote.kind,
            remote_name: self.remote.name.clone(),
            status: state.status,
            default_cwd: state.init.as_ref().map(|i| i.home_dir.clone()),
            error: state.error.clone(),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    fn set_status(&self, state: &mut ConnState, next: Status) -> bool {
        if !state.status.can_transition_to(next) {
            warn!(
                "[remote] {} ignoring status change {} -> {}",
                self.remote.name, state.status, next
            );
            return false;
        }
        info!(
            "[remote] {} status {} -> {}",
            self.remote.name, state.status, next
        );
        state.status = next;
        true
    }

    fn fail_launch(&self, generation: u64, err: &RemoteError) {
        let mut state = self.state.lock();
        if state.generation == generation && state.status == Status::Connecting {
            state.error = Some(err.to_string());
            self.set_status(&mut state, Status::Error);
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Launch
    // ═══════════════════════════════════════════════════════════════════

    /// Start the peer and wait for its `init` packet.
    pub async fn launch(self: &Arc<Self>) -> Result<(), RemoteError> {
        let generation = {
            let mut state = self.state.lock();
            if state.status.is_active() {
                return Err(RemoteError::AlreadyActive(self.remote.name.clone()));
            }
            self.set_status(&mut state, Status::Connecting);
            state.error = None;
            state.init = None;
            state.generation += 1;
            state.generation
        };
        // waiters left over from the previous peer
        self.registry.close_all();

        info!(
            "[remote] Launching peer for '{}' ({})",
            self.remote.name,
            self.remote.display_target()
        );

        let peer = match self.launcher.launch(&self.remote).await {
            Ok(peer) => peer,
            Err(e) => {
                error!("[remote] Launch of '{}' failed: {}", self.remote.name, e);
                self.fail_launch(generation, &e);
                return Err(e);
            }
        };

        let PeerProcess {
            reader,
            writer,
            stderr,
            exit,
            kill,
        } = peer;

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Packet>(PACKET_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Packet>(PACKET_BUFFER);

        let mut tasks = vec![
            tokio::spawn(read_packets(reader, inbound_tx.clone(), kill.clone())),
            tokio::spawn(write_packets(writer, outbound_rx, kill.clone())),
        ];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(read_stderr(stderr, inbound_tx.clone(), kill.clone())));
        }
        drop(inbound_tx);

        let handshake = tokio::time::timeout(
            self.settings.init_timeout(),
            self.await_init(&mut inbound_rx),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RemoteError::Launch(format!(
                "no init packet within {}s",
                self.settings.init_timeout_secs
            )))
        });

        let init = match handshake {
            Ok(init) => init,
            Err(e) => {
                error!("[remote] Handshake with '{}' failed: {}", self.remote.name, e);
                kill.cancel();
                abort_all(tasks);
                self.fail_launch(generation, &e);
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != Status::Connecting {
                drop(state);
                debug!("[remote] '{}' was stopped during launch", self.remote.name);
                kill.cancel();
                abort_all(tasks);
                return Err(RemoteError::PeerClosed);
            }

            state.reset_shell_states(init.state.as_ref());
            info!(
                "[remote] '{}' connected: peer {} user={} host={} home={}",
                self.remote.name, init.version, init.user, init.host_name, init.home_dir
            );
            state.init = Some(init);
            state.outbound = Some(outbound_tx);
            if let Some(previous) = state.kill.replace(kill.clone()) {
                previous.cancel();
            }
            self.set_status(&mut state, Status::Connected);
        }

        tasks.push(tokio::spawn(self.clone().watch_exit(exit, generation)));
        tasks.push(tokio::spawn(self.clone().dispatch_loop(inbound_rx, generation)));
        self.state.lock().tasks.extend(tasks);
        Ok(())
    }

    /// First packet must be `init`; raw noise before it is forwarded.
    async fn await_init(
        &self,
        inbound: &mut mpsc::Receiver<Packet>,
    ) -> Result<InitPacket, RemoteError> {
        loop {
            match inbound.recv().await {
                None => return Err(RemoteError::PeerClosed),
                Some(Packet::Init(init)) => return Ok(init),
                Some(packet @ Packet::Raw(_)) => self.publish(packet),
                Some(other) => {
                    return Err(RemoteError::Protocol(format!(
                        "expected init packet, got '{}'",
                        other.type_name()
                    )))
                }
            }
        }
    }

    async fn watch_exit(self: Arc<Self>, exit: BoxFuture<'static, PeerExit>, generation: u64) {
        let result = exit.await;
        match &result {
            Ok(code) => info!("[remote] Peer for '{}' exited ({:?})", self.remote.name, code),
            Err(e) => warn!("[remote] Peer for '{}' ended: {}", self.remote.name, e),
        }

        // readers keep draining to EOF; the dispatch loop fails what is left
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        if let Err(e) = &result {
            if state.error.is_none() {
                state.error = Some(e.clone());
            }
        }
        if state.status == Status::Connected {
            self.set_status(&mut state, Status::Disconnected);
        }
        state.outbound = None;
    }

    // ═══════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════

    /// Runs until the inbound stream closes.
    async fn dispatch_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Packet>,
        generation: u64,
    ) {
        while let Some(packet) = inbound.recv().await {
            self.dispatch(packet);
        }
        debug!("[remote] Dispatch loop for '{}' finished", self.remote.name);
        let current = {
            let mut state = self.state.lock();
            let current = state.generation == generation;
            if current {
                if state.status == Status::Connected {
                    self.set_status(&mut state, Status::Disconnected);
                }
                state.outbound = None;
            }
            current
        };
        // a newer launch owns the registry now
        if current {
            self.registry.close_all();
        }
    }

    fn dispatch(&self, packet: Packet) {
        if let Some(resp_id) = packet.resp_id() {
            let resp_id = resp_id.to_string();
            if self.registry.deliver(&resp_id, packet.clone()) {
                return;
            }
            warn!(
                "[remote] '{}' {} for unknown request {}",
                self.remote.name,
                packet.type_name(),
                resp_id
            );
            self.publish(packet);
            return;
        }

        match &packet {
            Packet::CmdData(data) | Packet::Data(data) => {
                debug!(
                    "[remote] {} {} fd={} len={} eof={}",
                    packet.type_name(),
                    data.ck,
                    data.fd_num,
                    data.data_len,
                    data.eof
                );
                if data.has_error() {
                    warn!(
                        "[remote] {} fd={} error: {}",
                        data.ck,
                        data.fd_num,
                        data.error.as_deref().unwrap_or_default()
                    );
                }
            }
            Packet::CmdDone(done) => {
                debug!(
                    "[remote] cmd-done {} exit={} ({}ms)",
                    done.ck, done.exit_code, done.duration_ms
                );
                self.record_final_state(done);
            }
            Packet::Message(msg) => match &msg.ck {
                Some(ck) => info!("[remote] message [{}]: {}", ck, msg.message),
                None => info!("[remote] message: {}", msg.message),
            },
            Packet::Raw(raw) => debug!("[remote] {} raw: {}", self.remote.name, raw.data),
            other => {
                warn!(
                    "[remote] '{}' sent unexpected '{}' packet",
                    self.remote.name,
                    other.type_name()
                );
            }
        }
        self.publish(packet);
    }

    fn publish(&self, packet: Packet) {
        // no subscribers is fine
        let _ = self.events.send(PeerEvent {
            remote_id: self.remote.remote_id.clone(),
            packet,
        });
    }

    fn record_final_state(&self, done: &CmdDonePacket) {
        let mut state = self.state.lock();
        let next = if let Some(full) = &done.final_state {
            if !full.hash_is_valid() {
                warn!("[shell-state] {} final state hash mismatch, ignored", done.ck);
                return;
            }
            full.clone()
        } else if let Some(delta) = &done.final_state_diff {
            let Some(base) = state.shell_states.get(&delta.base_hash) else {
                warn!(
                    "[shell-state] {} diff against unknown base {}",
                    done.ck, delta.base_hash
                );
                return;
            };
            match apply(base, delta) {
                Ok(next) => next,
                Err(e) => {
                    warn!("[shell-state] {} diff rejected: {}", done.ck, e);
                    return;
                }
            }
        } else {
            return;
        };

        debug!("[shell-state] {} now at {}", done.ck, next.hash);
        state.remember_state(next);
    }

    /// Number of shell states still held for diff bases
    pub fn shell_state_count(&self) -> usize {
        self.state.lock().shell_states.len()
    }

    pub fn shell_state(&self, hash: &str) -> Option<ShellState> {
        self.state.lock().shell_states.get(hash).cloned()
    }

    pub fn latest_shell_state(&self) -> Option<ShellState> {
        let state = self.state.lock();
        state
            .latest_state_hash
            .as_ref()
            .and_then(|hash| state.shell_states.get(hash))
            .cloned()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════

    fn outbound(&self) -> Result<mpsc::Sender<Packet>, RemoteError> {
        let state = self.state.lock();
        match (&state.status, &state.outbound) {
            (Status::Connected, Some(tx)) => Ok(tx.clone()),
            _ => Err(RemoteError::NotConnected(self.remote.name.clone())),
        }
    }

    /// Register, send, wait. The id is unregistered on every exit path.
    async fn exchange(
        &self,
        ctx: &CallContext,
        outbound: &mpsc::Sender<Packet>,
        req_id: &str,
        packet: Packet,
    ) -> Result<Packet, RemoteError> {
        let _registration = self.registry.register_guarded(req_id)?;
        ctx.run(outbound.send(packet))
            .await?
            .map_err(|_| RemoteError::PeerClosed)?;
        ctx.run(self.registry.wait(req_id))
            .await?
            .map_err(|e| match e {
                RpcError::Closed(_) => RemoteError::PeerClosed,
                other => other.into(),
            })
    }

    /// Start a command on the peer; returns once the peer acknowledges it.
    pub async fn run_command(
        &self,
        ctx: &CallContext,
        spec: CommandSpec,
    ) -> Result<CmdStartPacket, RemoteError> {
        let outbound = self.outbound()?;
        let (home_dir, state_hash) = {
            let state = self.state.lock();
            (
                state.init.as_ref().map(|i| i.home_dir.clone()).unwrap_or_default(),
                state.latest_state_hash.clone(),
            )
        };

        let req_id = Uuid::new_v4().to_string();
        let ck = CommandKey::new(
            spec.session_id,
            spec.cmd_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        );
        let packet = Packet::Run(RunPacket {
            req_id: req_id.clone(),
            ck: ck.clone(),
            cwd: spec.cwd.unwrap_or(home_dir),
            env: spec.env,
            use_pty: true,
            term_opts: spec
                .term_opts
                .unwrap_or_else(|| TermOpts::from(&self.settings.terminal)),
            command: spec.command.trim().to_string(),
            state_hash,
        });

        debug!("[remote] run {} on '{}' (req {})", ck, self.remote.name, req_id);
        match self.exchange(ctx, &outbound, &req_id, packet).await? {
            Packet::CmdStart(start) => Ok(start),
            Packet::Response(resp) => match resp.error_message() {
                Some(message) => Err(RemoteError::Remote(message.to_string())),
                None => Err(RemoteError::Protocol(format!(
                    "run request {} answered without cmd-start",
                    req_id
                ))),
            },
            other => Err(RemoteError::Protocol(format!(
                "unexpected '{}' packet for run request {}",
                other.type_name(),
                req_id
            ))),
        }
    }

    /// Send any request packet and wait for its `response`.
    pub async fn packet_rpc(
        &self,
        ctx: &CallContext,
        packet: Packet,
    ) -> Result<ResponsePacket, RemoteError> {
        let req_id = packet
            .req_id()
            .ok_or_else(|| {
                RemoteError::Protocol(format!(
                    "'{}' packet carries no request id",
                    packet.type_name()
                ))
            })?
            .to_string();
        let outbound = self.outbound()?;

        match self.exchange(ctx, &outbound, &req_id, packet).await? {
            Packet::Response(resp) => Ok(resp),
            other => Err(RemoteError::Protocol(format!(
                "expected response to {}, got '{}'",
                req_id,
                other.type_name()
            ))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Teardown
    // ═══════════════════════════════════════════════════════════════════

    /// Stop the peer. Pending requests fail with `PeerClosed`.
    pub fn disconnect(&self) {
        let kill = {
            let mut state = self.state.lock();
            if state.status.is_active() {
                self.set_status(&mut state, Status::Disconnected);
            }
            state.outbound = None;
            state.kill.take()
        };
        if let Some(kill) = kill {
            kill.cancel();
        }
        self.registry.close_all();
    }

    /// Join every background task of the current and earlier launches.
    pub async fn wait_stopped(&self) {
        let tasks = std::mem::take(&mut self.state.lock().tasks);
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("[remote] '{}' task panicked: {}", self.remote.name, e);
                }
            }
        }
    }
}

fn abort_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        task.abort();
    }
}

async fn read_packets(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    inbound: mpsc::Sender<Packet>,
    kill: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = kill.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if inbound.send(decode_line(&line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("[remote] Peer stdout read failed: {}", e);
                break;
            }
        }
    }
}

async fn read_stderr(
    stderr: Box<dyn AsyncRead + Send + Unpin>,
    inbound: mpsc::Sender<Packet>,
    kill: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = kill.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if inbound.send(Packet::raw(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

async fn write_packets(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound: mpsc::Receiver<Packet>,
    kill: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = kill.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let mut line = match encode_line(&packet) {
            Ok(line) => line,
            Err(e) => {
                error!("[remote] Failed to encode {} packet: {}", packet.type_name(), e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("[remote] Peer stdin write failed: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("[remote] Peer stdin flush failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
