//! SSH Keyword Resolution
//!
//! Merges per-remote overrides with ssh_config values and computed defaults.
//!
//! | keyword        | precedence                                              |
//! |----------------|---------------------------------------------------------|
//! | user           | override > config > current OS user                     |
//! | hostname       | config HostName > remote host                           |
//! | port           | override (unless 22) > config (unless 22) > "22"        |
//! | identity files | override files, then config files (accumulated)         |
//! | batch / auth   | config (with OpenSSH defaults)                          |

use serde::Serialize;

use crate::config::{RemoteDefinition, SshConfigLookup};

/// Authentication methods this crate can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethodKind {
    PublicKey,
    KeyboardInteractive,
    Password,
}

impl AuthMethodKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "publickey" => Some(AuthMethodKind::PublicKey),
            "keyboard-interactive" => Some(AuthMethodKind::KeyboardInteractive),
            "password" => Some(AuthMethodKind::Password),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethodKind::PublicKey => "publickey",
            AuthMethodKind::KeyboardInteractive => "keyboard-interactive",
            AuthMethodKind::Password => "password",
        }
    }
}

/// Raw values found in ssh_config for one host pattern
#[derive(Debug, Clone, Default)]
pub struct ConfigKeywords {
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub identity_files: Vec<String>,
    pub batch_mode: bool,
    pub pubkey_authentication: bool,
    pub password_authentication: bool,
    pub kbd_interactive_authentication: bool,
    pub preferred_authentications: Vec<String>,
    pub user_known_hosts_files: Vec<String>,
    pub global_known_hosts_files: Vec<String>,
}

/// `yes` is the only truthy value
fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes")
}

/// Anything but `no` counts as enabled
fn is_not_no(value: &str) -> bool {
    !value.eq_ignore_ascii_case("no")
}

/// Look up every keyword for `host` in ssh_config.
pub fn find_config_keywords(lookup: &SshConfigLookup, host: &str) -> ConfigKeywords {
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    let list = |v: String| -> Vec<String> { v.split_whitespace().map(str::to_string).collect() };

    ConfigKeywords {
        user: non_empty(lookup.explicit(host, "User")),
        hostname: non_empty(lookup.explicit(host, "HostName")),
        port: non_empty(lookup.explicit(host, "Port")),
        identity_files: lookup.get_all(host, "IdentityFile"),
        batch_mode: is_yes(&lookup.get(host, "BatchMode")),
        pubkey_authentication: is_not_no(&lookup.get(host, "PubkeyAuthentication")),
        password_authentication: is_not_no(&lookup.get(host, "PasswordAuthentication")),
        kbd_interactive_authentication: is_not_no(
            &lookup.get(host, "KbdInteractiveAuthentication"),
        ),
        preferred_authentications: lookup
            .get(host, "PreferredAuthentications")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        user_known_hosts_files: list(lookup.get(host, "UserKnownHostsFile")),
        global_known_hosts_files: list(lookup.get(host, "GlobalKnownHostsFile")),
    }
}

/// Effective connection keywords for one ssh remote
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeywords {
    pub user: String,
    pub hostname: String,
    pub port: String,
    pub identity_files: Vec<String>,
    pub batch_mode: bool,
    pub pubkey_authentication: bool,
    pub password_authentication: bool,
    pub kbd_interactive_authentication: bool,
    pub preferred_authentications: Vec<String>,
    pub user_known_hosts_files: Vec<String>,
    pub global_known_hosts_files: Vec<String>,
}

impl SshKeywords {
    /// Numeric port (the merge guarantees a non-empty string)
    pub fn port_number(&self) -> Option<u16> {
        self.port.parse().ok()
    }

    /// Methods in preferred order, keeping only enabled ones we support.
    pub fn enabled_methods(&self) -> Vec<AuthMethodKind> {
        let mut methods = Vec::new();
        for name in &self.preferred_authentications {
            let Some(kind) = AuthMethodKind::from_name(name) else {
                continue;
            };
            let enabled = match kind {
                AuthMethodKind::PublicKey => self.pubkey_authentication,
                AuthMethodKind::KeyboardInteractive => self.kbd_interactive_authentication,
                AuthMethodKind::Password => self.password_authentication,
            };
            if enabled && !methods.contains(&kind) {
                methods.push(kind);
            }
        }
        methods
    }
}

/// Merge a remote's overrides with its ssh_config keywords.
pub fn combine_keywords(remote: &RemoteDefinition, config: ConfigKeywords) -> SshKeywords {
    let user = remote
        .user
        .clone()
        .filter(|u| !u.is_empty())
        .or(config.user)
        .unwrap_or_else(whoami::username);

    let hostname = config.hostname.unwrap_or_else(|| remote.host.clone());

    let port = match (remote.port, config.port) {
        (Some(p), _) if p != 0 && p != 22 => p.to_string(),
        (_, Some(p)) if p != "22" => p,
        _ => "22".to_string(),
    };

    let mut identity_files: Vec<String> = remote
        .identity_files
        .iter()
        .filter(|f| !f.is_empty())
        .cloned()
        .collect();
    identity_files.extend(config.identity_files);

    SshKeywords {
        user,
        hostname,
        port,
        identity_files,
        batch_mode: config.batch_mode,
        pubkey_authentication: config.pubkey_authentication,
        password_authentication: config.password_authentication,
        kbd_interactive_authentication: config.kbd_interactive_authentication,
        preferred_authentications: config.preferred_authentications,
        user_known_hosts_files: config.user_known_hosts_files,
        global_known_hosts_files: config.global_known_hosts_files,
    }
}
