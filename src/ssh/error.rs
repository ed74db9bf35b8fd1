//! SSH Error types

use thiserror::Error;

use crate::interaction::PromptError;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Every enabled method's budget is spent
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The user declined or cancelled an interactive prompt. Terminal.
    #[error("Canceled by the user: {0}")]
    UserCancelled(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("host key for {host} has been revoked")]
    HostKeyRevoked { host: String },

    #[error("remote host identification has changed")]
    HostKeyChanged { host: String, fingerprint: String },

    /// No usable known_hosts locations
    #[error("Known hosts configuration error: {0}")]
    KnownHostsConfig(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// User declined a prompt; callers must not retry.
    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, SshError::UserCancelled(_))
    }

    /// Revoked or changed host key.
    pub fn is_trust_violation(&self) -> bool {
        matches!(
            self,
            SshError::HostKeyRevoked { .. } | SshError::HostKeyChanged { .. }
        )
    }

    /// Wrap a prompt failure. Cancellation stays distinguishable; a timeout
    /// or a missing front end counts as the user not answering.
    pub fn from_prompt(context: &str, err: PromptError) -> Self {
        match err {
            PromptError::Cancelled => SshError::UserCancelled(context.to_string()),
            other => SshError::UserCancelled(format!("{}: {}", context, other)),
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
