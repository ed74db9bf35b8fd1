//! Peer Packet Protocol
//!
//! One JSON object per line, discriminated by `type`. Lines that are not
//! valid packets are surfaced as `raw` packets so nothing the peer prints is
//! lost.
//!
//! ```text
//! core -> peer : run, rpc
//! peer -> core : init, cmd-start, cmd-data, cmd-done, data, message, raw, response
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::TerminalDefaults;
use crate::shell::{ShellState, ShellStateDiff, ShellType};

/// (session, command) pair scoping a command's lifecycle packets.
/// Wire form: `"<session>/<command>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandKey {
    pub session_id: String,
    pub cmd_id: String,
}

impl CommandKey {
    pub fn new(session_id: impl Into<String>, cmd_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cmd_id: cmd_id.into(),
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.cmd_id)
    }
}

impl From<CommandKey> for String {
    fn from(ck: CommandKey) -> String {
        ck.to_string()
    }
}

impl TryFrom<String> for CommandKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once('/') {
            Some((session, cmd)) if !session.is_empty() && !cmd.is_empty() => {
                Ok(CommandKey::new(session, cmd))
            }
            _ => Err(format!("invalid command key '{}'", value)),
        }
    }
}

/// Terminal geometry for commands run under a pty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermOpts {
    pub rows: u16,
    pub cols: u16,
    pub term: String,
}

impl From<&TerminalDefaults> for TermOpts {
    fn from(t: &TerminalDefaults) -> Self {
        Self {
            rows: t.rows,
            cols: t.cols,
            term: t.term.clone(),
        }
    }
}

/// First packet of every peer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPacket {
    pub version: String,
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_type: Option<ShellType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ShellState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPacket {
    pub req_id: String,
    pub ck: CommandKey,
    #[serde(default)]
    pub cwd: String,
    /// `null` means inherit the peer's environment
    pub env: Option<BTreeMap<String, String>>,
    pub use_pty: bool,
    pub term_opts: TermOpts,
    pub command: String,
    /// Hash of the synchronized shell state the command should start from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}

/// Generic request (everything that is not `run`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcPacket {
    pub req_id: String,
    pub command: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl RpcPacket {
    pub fn new(command: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            req_id: uuid::Uuid::new_v4().to_string(),
            command: command.into(),
            args,
        }
    }
}

/// Start descriptor returned for a `run` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdStartPacket {
    pub resp_id: String,
    pub ck: CommandKey,
    #[serde(default)]
    pub pid: Option<i32>,
}

/// Output chunk; used by both `data` and `cmd-data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPacket {
    pub ck: CommandKey,
    pub fd_num: i32,
    /// base64 payload
    #[serde(default)]
    pub data64: String,
    pub data_len: usize,
    #[serde(default)]
    pub eof: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataPacket {
    pub fn has_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdDonePacket {
    pub ck: CommandKey,
    pub exit_code: i32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<ShellState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state_diff: Option<ShellStateDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ck: Option<CommandKey>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPacket {
    pub data: String,
}

/// RPC reply: success payload or a non-empty error string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePacket {
    pub resp_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponsePacket {
    pub fn ok(resp_id: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            resp_id: resp_id.into(),
            success: true,
            error: None,
            data,
        }
    }

    pub fn err(resp_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            resp_id: resp_id.into(),
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }

    /// The error string, if the peer reported one
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Packet {
    Init(InitPacket),
    Run(RunPacket),
    Rpc(RpcPacket),
    CmdStart(CmdStartPacket),
    CmdData(DataPacket),
    CmdDone(CmdDonePacket),
    Data(DataPacket),
    Message(MessagePacket),
    Raw(RawPacket),
    Response(ResponsePacket),
}

impl Packet {
    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::Init(_) => "init",
            Packet::Run(_) => "run",
            Packet::Rpc(_) => "rpc",
            Packet::CmdStart(_) => "cmd-start",
            Packet::CmdData(_) => "cmd-data",
            Packet::CmdDone(_) => "cmd-done",
            Packet::Data(_) => "data",
            Packet::Message(_) => "message",
            Packet::Raw(_) => "raw",
            Packet::Response(_) => "response",
        }
    }

    /// Request id of an outgoing request
    pub fn req_id(&self) -> Option<&str> {
        match self {
            Packet::Run(p) => Some(&p.req_id),
            Packet::Rpc(p) => Some(&p.req_id),
            _ => None,
        }
    }

    /// Request id a peer packet answers
    pub fn resp_id(&self) -> Option<&str> {
        match self {
            Packet::CmdStart(p) => Some(&p.resp_id),
            Packet::Response(p) => Some(&p.resp_id),
            _ => None,
        }
    }

    pub fn raw(data: impl Into<String>) -> Self {
        Packet::Raw(RawPacket { data: data.into() })
    }
}

/// Serialize one packet as a line (without the newline).
pub fn encode_line(packet: &Packet) -> Result<String, serde_json::Error> {
    serde_json::to_string(packet)
}

/// Parse one line; anything that is not a packet becomes `raw`.
pub fn decode_line(line: &str) -> Packet {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    match serde_json::from_str::<Packet>(trimmed) {
        Ok(packet) => packet,
        Err(_) => Packet::raw(trimmed),
    }
}
