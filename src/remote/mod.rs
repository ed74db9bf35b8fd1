//! Remote Module
//!
//! Peer processes, the packet protocol spoken over their stdio, request /
//! response correlation and the directory of all known remotes.
//!
//! # Architecture
//!
//! ```text
//! RemoteDirectory ──┬── Connection (remote A) ── peer (local subprocess)
//!                   └── Connection (remote B) ── peer (ssh exec channel)
//!                            │
//!                            ├── OutstandingRequestRegistry  (run / rpc replies)
//!                            └── broadcast<PeerEvent>        (data, cmd-*, message, raw)
//! ```

pub mod connection;
pub mod context;
pub mod directory;
pub mod error;
pub mod packet;
pub mod peer;
pub mod rpc;
pub mod status;

pub use connection::{CommandSpec, Connection, PeerEvent};
pub use context::{CallContext, ContextError};
pub use directory::RemoteDirectory;
pub use error::RemoteError;
pub use packet::{
    CmdDonePacket, CmdStartPacket, CommandKey, DataPacket, InitPacket, MessagePacket, Packet,
    RawPacket, ResponsePacket, RpcPacket, RunPacket, TermOpts,
};
pub use peer::{DefaultPeerLauncher, PeerExit, PeerLauncher, PeerProcess};
pub use rpc::{OutstandingRequestRegistry, RegistrationGuard, RpcError};
pub use status::{RemoteStatus, Status};
