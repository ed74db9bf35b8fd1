//! Persisted Remote Definitions
//!
//! The JSON document stored under the config directory. Definitions are
//! immutable once loaded except through an explicit user edit.

use serde::{Deserialize, Serialize};

/// Current version of the remotes file format
pub const CONFIG_VERSION: u32 = 1;

/// How the peer process is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// Peer subprocess on this machine
    Local,
    /// Peer started over an SSH exec channel
    Ssh,
}

impl RemoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteKind::Local => "local",
            RemoteKind::Ssh => "ssh",
        }
    }
}

impl std::fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single remote target.
///
/// `host`, `port`, `user` and `identity_files` are per-remote overrides; the
/// effective values are merged with ssh_config at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDefinition {
    pub remote_id: String,
    /// Display name (unique, used for lookups and prompts)
    pub name: String,
    pub kind: RemoteKind,

    /// ssh_config host pattern (alias or real hostname)
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_files: Vec<String>,

    /// Stored secret, tried once as password and once as key passphrase.
    /// Never written to the remotes file; saving moves it to the keychain.
    #[serde(skip)]
    pub password: Option<String>,
    /// Keychain entry holding the stored secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_keychain_id: Option<String>,

    #[serde(default)]
    pub auto_connect: bool,
}

impl RemoteDefinition {
    /// A local-process remote.
    pub fn local(remote_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            name: name.into(),
            kind: RemoteKind::Local,
            host: String::new(),
            port: None,
            user: None,
            identity_files: Vec::new(),
            password: None,
            password_keychain_id: None,
            auto_connect: false,
        }
    }

    /// An ssh remote for `host` with no overrides.
    pub fn ssh(
        remote_id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            kind: RemoteKind::Ssh,
            host: host.into(),
            ..Self::local(remote_id, name)
        }
    }

    /// `user@host:port` for log lines (never includes the password).
    pub fn display_target(&self) -> String {
        match self.kind {
            RemoteKind::Local => format!("local:{}", self.name),
            RemoteKind::Ssh => {
                let mut target = String::new();
                if let Some(user) = &self.user {
                    target.push_str(user);
                    target.push('@');
                }
                target.push_str(&self.host);
                if let Some(port) = self.port {
                    target.push_str(&format!(":{}", port));
                }
                target
            }
        }
    }
}

/// On-disk document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotesFile {
    pub version: u32,
    #[serde(default)]
    pub remotes: Vec<RemoteDefinition>,
}

impl Default for RemotesFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            remotes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_json_shape() {
        let json = r#"{
            "remoteId": "r1",
            "name": "build-box",
            "kind": "ssh",
            "host": "build",
            "port": 2222,
            "identityFiles": ["~/.ssh/build_ed25519"],
            "autoConnect": true
        }"#;
        let def: RemoteDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.kind, RemoteKind::Ssh);
        assert_eq!(def.port, Some(2222));
        assert!(def.user.is_none());
        assert!(def.password.is_none());
        assert!(def.password_keychain_id.is_none());
        assert!(def.auto_connect);
    }

    #[test]
    fn test_password_never_serialized() {
        let mut def = RemoteDefinition::ssh("r1", "prod", "prod");
        def.password = Some("hunter2".into());
        def.password_keychain_id = Some("oxideterm-remote-r1".into());
        let json = serde_json::to_string(&def).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains(r#""passwordKeychainId":"oxideterm-remote-r1""#));

        // a legacy plaintext field is ignored on load
        let legacy = r#"{"remoteId":"r1","name":"p","kind":"ssh","password":"hunter2"}"#;
        let def: RemoteDefinition = serde_json::from_str(legacy).unwrap();
        assert!(def.password.is_none());
    }

    #[test]
    fn test_display_target_hides_password() {
        let mut def = RemoteDefinition::ssh("r1", "prod", "prod.example.com");
        def.user = Some("deploy".into());
        def.port = Some(2222);
        def.password = Some("secret".into());
        let shown = def.display_target();
        assert_eq!(shown, "deploy@prod.example.com:2222");
        assert!(!shown.contains("secret"));
    }
}
