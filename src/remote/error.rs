//! Remote error types

use serde::Serialize;
use thiserror::Error;

use super::context::ContextError;
use super::rpc::RpcError;
use crate::config::StorageError;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote '{0}' not found")]
    NotFound(String),

    /// Operation needs a Connected peer
    #[error("remote '{0}' is not connected")]
    NotConnected(String),

    #[error("remote '{0}' is already connecting or connected")]
    AlreadyActive(String),

    /// Unexpected or malformed packet where a specific reply was expected
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error string reported by the peer, verbatim
    #[error("{0}")]
    Remote(String),

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("failed to launch peer: {0}")]
    Launch(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// The caller gave up waiting (cancel or deadline), as opposed to the
    /// remote refusing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RemoteError::Cancelled | RemoteError::DeadlineExceeded)
    }

    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, RemoteError::Ssh(e) if e.is_user_cancelled())
    }
}

impl From<ContextError> for RemoteError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => RemoteError::Cancelled,
            ContextError::DeadlineExceeded => RemoteError::DeadlineExceeded,
        }
    }
}

impl Serialize for RemoteError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_is_verbatim() {
        let err = RemoteError::Remote("permission denied".into());
        assert_eq!(err.to_string(), "permission denied");
    }

    #[test]
    fn test_cancellation_kinds() {
        assert!(RemoteError::from(ContextError::DeadlineExceeded).is_cancelled());
        assert!(RemoteError::from(ContextError::Cancelled).is_cancelled());
        assert!(!RemoteError::Protocol("x".into()).is_cancelled());
        assert!(RemoteError::from(SshError::UserCancelled("host key".into())).is_user_cancelled());
    }
}
