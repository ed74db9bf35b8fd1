//! Connection status state machine

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RemoteKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Init,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl Status {
    /// Allowed edges. Nothing returns to `Init`; a stopped connection may
    /// be launched again.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Disconnected, Connecting)
                | (Error, Connecting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "init",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
            Status::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Connecting | Status::Connected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `RemoteDirectory::list_statuses`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub remote_id: String,
    pub remote_type: RemoteKind,
    pub remote_name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(Status::Init.can_transition_to(Status::Connecting));
        assert!(Status::Connecting.can_transition_to(Status::Connected));
        assert!(Status::Connected.can_transition_to(Status::Disconnected));
        assert!(Status::Error.can_transition_to(Status::Connecting));

        assert!(!Status::Init.can_transition_to(Status::Connected));
        assert!(!Status::Connected.can_transition_to(Status::Init));
        assert!(!Status::Disconnected.can_transition_to(Status::Init));
        assert!(!Status::Connected.can_transition_to(Status::Connecting));
    }

    #[test]
    fn test_status_row_serialization() {
        let row = RemoteStatus {
            remote_id: "r1".into(),
            remote_type: RemoteKind::Ssh,
            remote_name: "web".into(),
            status: Status::Connected,
            default_cwd: Some("/home/me".into()),
            error: None,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["remoteType"], "ssh");
        assert_eq!(json["status"], "connected");
        assert_eq!(json["defaultCwd"], "/home/me");
        assert!(json.get("error").is_none());
    }
}
