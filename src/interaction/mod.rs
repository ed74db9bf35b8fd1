//! User Interaction Bus
//!
//! Every interactive credential or trust decision (passwords, key
//! passphrases, keyboard-interactive answers, "trust this host key?")
//! goes through the [`UserInteraction`] seam. The default implementation,
//! [`UserInputBus`], publishes requests to whatever front end subscribes
//! and parks the asking task on a oneshot until the front end answers,
//! cancels, or the caller's timeout elapses.
//!
//! # Flow
//!
//! ```text
//! Front end                               Core
//!    │                                     │
//!    │◀──── InteractionEvent::Request ─────│ register pending + emit
//!    │                                     │
//!    │───── respond(UserInputResponse) ───▶│ wake the waiting task
//!    │  or  cancel(request_id)             │
//!    │                                     │
//!    │◀──── InteractionEvent::Alert ───────│ non-interactive warnings
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// What kind of answer the front end must collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Free text (passwords, passphrases, challenge answers)
    Text,
    /// Yes / no
    Confirm,
}

/// A prompt shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputRequest {
    /// Unique ID routing the response back to the waiting task
    pub request_id: String,
    pub kind: InputKind,
    pub title: String,
    pub query_text: String,
    /// `query_text` is markdown
    #[serde(default)]
    pub markdown: bool,
    /// How long the core waits before giving up (informational for the UI)
    pub timeout_ms: u64,
}

impl UserInputRequest {
    pub fn text(title: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self::new(InputKind::Text, title, query_text)
    }

    pub fn confirm(title: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self::new(InputKind::Confirm, title, query_text)
    }

    fn new(kind: InputKind, title: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            query_text: query_text.into(),
            markdown: false,
            timeout_ms: 0,
        }
    }

    pub fn with_markdown(mut self) -> Self {
        self.markdown = true;
        self
    }
}

/// The user's answer to a [`UserInputRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<bool>,
}

impl UserInputResponse {
    pub fn text(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            text: Some(text.into()),
            confirm: None,
        }
    }

    pub fn confirm(request_id: impl Into<String>, confirm: bool) -> Self {
        Self {
            request_id: request_id.into(),
            text: None,
            confirm: Some(confirm),
        }
    }

    /// A missing confirm flag counts as "no".
    pub fn confirmed(&self) -> bool {
        self.confirm.unwrap_or(false)
    }
}

/// Non-interactive, prominent notification (e.g. host key changed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub markdown: bool,
}

/// Events published to the front end.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InteractionEvent {
    Request(UserInputRequest),
    Alert(Alert),
}

/// Errors while waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    /// The user (or the caller) cancelled the prompt
    #[error("prompt cancelled by the user")]
    Cancelled,

    /// Nobody answered within the allowed time
    #[error("no response within {0} seconds")]
    Timeout(u64),

    /// Request ID unknown (already answered, timed out, or never issued)
    #[error("user input request not found")]
    RequestNotFound,

    /// No front end is listening, or the bus went away
    #[error("user input channel closed")]
    Closed,
}

/// The seam every interactive step goes through.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    /// Ask the user and wait at most `timeout` for the answer.
    async fn request_input(
        &self,
        request: UserInputRequest,
        timeout: Duration,
    ) -> Result<UserInputResponse, PromptError>;

    /// Raise a non-interactive alert. Never blocks.
    fn alert(&self, alert: Alert);
}

type PendingSender = oneshot::Sender<Result<UserInputResponse, PromptError>>;

/// Broadcast-based implementation of [`UserInteraction`].
pub struct UserInputBus {
    /// request_id -> waiting task
    pending: Mutex<HashMap<String, PendingSender>>,
    events: broadcast::Sender<InteractionEvent>,
}

impl UserInputBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to prompts and alerts (front end side).
    pub fn subscribe(&self) -> broadcast::Receiver<InteractionEvent> {
        self.events.subscribe()
    }

    /// Deliver the user's answer to the waiting task.
    pub fn respond(&self, response: UserInputResponse) -> Result<(), PromptError> {
        let sender = self
            .pending
            .lock()
            .remove(&response.request_id)
            .ok_or(PromptError::RequestNotFound)?;

        // Receiver gone means the request already timed out
        let _ = sender.send(Ok(response));
        Ok(())
    }

    /// Cancel a pending prompt (user closed the dialog).
    pub fn cancel(&self, request_id: &str) -> Result<(), PromptError> {
        let sender = self
            .pending
            .lock()
            .remove(request_id)
            .ok_or(PromptError::RequestNotFound)?;

        let _ = sender.send(Err(PromptError::Cancelled));
        Ok(())
    }

    /// Number of prompts still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn cleanup(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
    }
}

/// Removes a pending prompt when its waiter goes away, answered or not.
struct PendingGuard<'a> {
    bus: &'a UserInputBus,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.bus.cleanup(&self.request_id);
    }
}

impl Default for UserInputBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserInteraction for UserInputBus {
    async fn request_input(
        &self,
        mut request: UserInputRequest,
        timeout: Duration,
    ) -> Result<UserInputResponse, PromptError> {
        request.timeout_ms = timeout.as_millis() as u64;
        let request_id = request.request_id.clone();

        // Register BEFORE emitting so a fast answer cannot be lost
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        let _pending = PendingGuard {
            bus: self,
            request_id: request_id.clone(),
        };

        debug!("[user-input] Prompt {} ({})", request_id, request.title);
        if self.events.send(InteractionEvent::Request(request)).is_err() {
            return Err(PromptError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PromptError::Closed),
            Err(_) => {
                warn!(
                    "[user-input] Prompt {} timed out after {}s",
                    request_id,
                    timeout.as_secs()
                );
                Err(PromptError::Timeout(timeout.as_secs()))
            }
        }
    }

    fn alert(&self, alert: Alert) {
        warn!("[user-input] ALERT: {}", alert.title);
        let _ = self.events.send(InteractionEvent::Alert(alert));
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_respond_wakes_waiter() {
        let bus = Arc::new(UserInputBus::new());
        let mut events = bus.subscribe();

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request_input(
                    UserInputRequest::text("Password Authentication", "Password:"),
                    Duration::from_secs(5),
                )
                .await
            })
        };

        let request = match events.recv().await.unwrap() {
            InteractionEvent::Request(r) => r,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(request.kind, InputKind::Text);
        assert_eq!(request.timeout_ms, 5000);

        bus.respond(UserInputResponse::text(&request.request_id, "hunter2"))
            .unwrap();
        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.text.as_deref(), Some("hunter2"));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_distinguishable() {
        let bus = Arc::new(UserInputBus::new());
        let mut events = bus.subscribe();

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request_input(
                    UserInputRequest::confirm("Known Hosts Key Missing", "Trust?"),
                    Duration::from_secs(5),
                )
                .await
            })
        };

        let InteractionEvent::Request(request) = events.recv().await.unwrap() else {
            panic!("expected request");
        };
        bus.cancel(&request.request_id).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap_err(), PromptError::Cancelled);
    }

    #[tokio::test]
    async fn test_timeout_cleans_up() {
        let bus = UserInputBus::new();
        let _events = bus.subscribe();

        let err = bus
            .request_input(
                UserInputRequest::text("t", "q"),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PromptError::Timeout(_)));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_front_end_is_closed() {
        let bus = UserInputBus::new();
        let err = bus
            .request_input(UserInputRequest::text("t", "q"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, PromptError::Closed);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_prompt_is_removed() {
        let bus = Arc::new(UserInputBus::new());
        let mut events = bus.subscribe();

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.request_input(
                    UserInputRequest::text("Publickey Auth + Passphrase", "Passphrase:"),
                    Duration::from_secs(60),
                )
                .await
            })
        };
        let InteractionEvent::Request(request) = events.recv().await.unwrap() else {
            panic!("expected request");
        };
        assert_eq!(bus.pending_count(), 1);

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(bus.pending_count(), 0);
        assert_eq!(
            bus.respond(UserInputResponse::text(&request.request_id, "late")),
            Err(PromptError::RequestNotFound)
        );
    }

    #[test]
    fn test_unknown_request_id() {
        let bus = UserInputBus::new();
        assert_eq!(
            bus.respond(UserInputResponse::confirm("nope", true)),
            Err(PromptError::RequestNotFound)
        );
    }
}
