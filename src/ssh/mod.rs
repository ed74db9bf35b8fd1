//! SSH module - negotiates transports for ssh remotes
//!
//! # Features
//! - ssh_config keyword merge with per-remote overrides
//! - publickey / keyboard-interactive / password with per-method retry budgets
//! - Host key verification against known_hosts with trust-on-first-use
//! - Exec channels that carry the peer packet stream

pub mod auth;
mod client;
mod error;
pub mod keywords;
pub mod known_hosts;

pub use client::{authenticate, AuthSession, ClientHandler, KbiStep, SshNegotiator, SshTransport};
pub use error::SshError;
pub use keywords::{combine_keywords, find_config_keywords, AuthMethodKind, SshKeywords};
pub use known_hosts::{HostKeyVerification, HostTrustStore, OfferedHostKey};
