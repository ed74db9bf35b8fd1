//! Configuration Management Module
//!
//! Persisted remote definitions, runtime settings, and OpenSSH config lookup.

pub mod keychain;
pub mod settings;
pub mod ssh_config;
pub mod storage;
pub mod types;

pub use keychain::{password_keychain_id, Keychain, KeychainError, SecretStore};
pub use settings::{RemoteSettings, TerminalDefaults};
pub use ssh_config::{
    default_ssh_config_path, expand_tilde, parse_ssh_config_content, SshConfigError,
    SshConfigHost, SshConfigLookup,
};
pub use storage::{
    config_dir, remotes_file, validate_remotes, ConfigStorage, RemoteStore, StorageError,
};
pub use types::{RemoteDefinition, RemoteKind, RemotesFile, CONFIG_VERSION};
