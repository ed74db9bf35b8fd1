//! Runtime Settings
//!
//! Knobs for peer launch, timeouts and ssh config discovery. Every field has
//! a default so a partial JSON object deserializes cleanly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ssh_config::expand_tilde;

pub const DEFAULT_TERM_ROWS: u16 = 25;
pub const DEFAULT_TERM_COLS: u16 = 80;
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Default terminal geometry attached to every `run` packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDefaults {
    pub rows: u16,
    pub cols: u16,
    pub term: String,
}

impl Default for TerminalDefaults {
    fn default() -> Self {
        Self {
            rows: DEFAULT_TERM_ROWS,
            cols: DEFAULT_TERM_COLS,
            term: DEFAULT_TERM.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteSettings {
    /// Peer binary for local remotes
    pub local_peer_path: PathBuf,
    pub local_peer_args: Vec<String>,
    /// Command executed over the ssh exec channel for ssh remotes
    pub remote_peer_command: String,

    pub init_timeout_secs: u64,
    pub ssh_connect_timeout_secs: u64,
    pub prompt_timeout_secs: u64,
    pub capture_timeout_secs: u64,

    pub terminal: TerminalDefaults,

    /// ssh_config files in precedence order
    pub ssh_config_paths: Vec<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            local_peer_path: PathBuf::from("oxideterm-peer"),
            local_peer_args: vec!["--server".to_string()],
            remote_peer_command: "oxideterm-peer --server".to_string(),
            init_timeout_secs: 10,
            ssh_connect_timeout_secs: 30,
            prompt_timeout_secs: 60,
            capture_timeout_secs: 5,
            terminal: TerminalDefaults::default(),
            ssh_config_paths: vec![
                "~/.ssh/config".to_string(),
                "/etc/ssh/ssh_config".to_string(),
            ],
        }
    }
}

impl RemoteSettings {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    /// ssh_config paths with `~` expanded
    pub fn ssh_config_files(&self) -> Vec<PathBuf> {
        self.ssh_config_paths
            .iter()
            .map(|p| expand_tilde(p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: RemoteSettings =
            serde_json::from_str(r#"{ "promptTimeoutSecs": 5 }"#).unwrap();
        assert_eq!(settings.prompt_timeout(), Duration::from_secs(5));
        assert_eq!(settings.init_timeout(), Duration::from_secs(10));
        assert_eq!(settings.local_peer_args, vec!["--server"]);
        assert_eq!(settings.terminal, TerminalDefaults::default());
    }

    #[test]
    fn test_terminal_defaults() {
        let term = TerminalDefaults::default();
        assert_eq!((term.rows, term.cols), (25, 80));
        assert_eq!(term.term, "xterm-256color");
    }
}
