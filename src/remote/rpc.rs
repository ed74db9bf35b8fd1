//! Outstanding Request Registry
//!
//! Maps a request id to a single-fulfillment slot. The request side
//! registers before sending, then waits; the dispatch loop delivers the
//! matching reply. A slot lives until it is unregistered, so a reply that
//! arrives before the waiter starts waiting is not lost.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::packet::Packet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("request id '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("request id '{0}' is not registered")]
    NotRegistered(String),

    #[error("request id '{0}' already has a waiter")]
    AlreadyWaiting(String),

    /// The slot was dropped (peer went away) before a reply arrived
    #[error("request '{0}' closed without a response")]
    Closed(String),
}

struct Slot {
    tx: Option<oneshot::Sender<Packet>>,
    rx: Option<oneshot::Receiver<Packet>>,
}

#[derive(Default)]
pub struct OutstandingRequestRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl OutstandingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, req_id: &str) -> Result<(), RpcError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(req_id) {
            return Err(RpcError::AlreadyRegistered(req_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(
            req_id.to_string(),
            Slot {
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        Ok(())
    }

    /// Register and unregister automatically when the guard drops.
    pub fn register_guarded(&self, req_id: &str) -> Result<RegistrationGuard<'_>, RpcError> {
        self.register(req_id)?;
        Ok(RegistrationGuard {
            registry: self,
            req_id: req_id.to_string(),
        })
    }

    /// Hand a reply to its slot. False when the id is unknown or the slot
    /// was already fulfilled.
    pub fn deliver(&self, resp_id: &str, packet: Packet) -> bool {
        let tx = {
            let mut slots = self.slots.lock();
            match slots.get_mut(resp_id) {
                Some(slot) => slot.tx.take(),
                None => None,
            }
        };
        match tx {
            Some(tx) => {
                // receiver gone means the waiter already gave up
                let _ = tx.send(packet);
                true
            }
            None => false,
        }
    }

    /// Wait for the reply to a registered request.
    pub async fn wait(&self, req_id: &str) -> Result<Packet, RpcError> {
        let rx = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(req_id)
                .ok_or_else(|| RpcError::NotRegistered(req_id.to_string()))?;
            slot.rx
                .take()
                .ok_or_else(|| RpcError::AlreadyWaiting(req_id.to_string()))?
        };
        rx.await.map_err(|_| RpcError::Closed(req_id.to_string()))
    }

    /// Remove the slot. True when something was removed.
    pub fn unregister(&self, req_id: &str) -> bool {
        self.slots.lock().remove(req_id).is_some()
    }

    /// Fail every pending waiter (peer gone). Slots stay until unregistered.
    pub fn close_all(&self) {
        let mut slots = self.slots.lock();
        let mut closed = 0;
        for slot in slots.values_mut() {
            if slot.tx.take().is_some() {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!("[remote] Closed {} outstanding requests", closed);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters its request id exactly once, on drop.
pub struct RegistrationGuard<'a> {
    registry: &'a OutstandingRequestRegistry,
    req_id: String,
}

impl RegistrationGuard<'_> {
    pub fn req_id(&self) -> &str {
        &self.req_id
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.req_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::remote::packet::ResponsePacket;

    fn reply(id: &str) -> Packet {
        Packet::Response(ResponsePacket::ok(id, None))
    }

    #[tokio::test]
    async fn test_deliver_before_wait() {
        let registry = OutstandingRequestRegistry::new();
        registry.register("a").unwrap();
        assert!(registry.deliver("a", reply("a")));
        assert_eq!(registry.wait("a").await.unwrap().resp_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_single_fulfillment() {
        let registry = OutstandingRequestRegistry::new();
        registry.register("a").unwrap();
        assert!(registry.deliver("a", reply("a")));
        assert!(!registry.deliver("a", reply("a")));
        assert!(!registry.deliver("unknown", reply("unknown")));
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let registry = OutstandingRequestRegistry::new();
        registry.register("a").unwrap();
        assert_eq!(
            registry.register("a"),
            Err(RpcError::AlreadyRegistered("a".into()))
        );
    }

    #[tokio::test]
    async fn test_wait_unregistered_fails() {
        let registry = OutstandingRequestRegistry::new();
        assert_eq!(
            registry.wait("never").await.unwrap_err(),
            RpcError::NotRegistered("never".into())
        );
    }

    #[tokio::test]
    async fn test_reuse_after_unregister_has_no_residue() {
        let registry = OutstandingRequestRegistry::new();
        registry.register("a").unwrap();
        registry.deliver("a", reply("stale"));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));

        registry.register("a").unwrap();
        let waiter = tokio::time::timeout(Duration::from_millis(20), registry.wait("a")).await;
        assert!(waiter.is_err(), "stale reply leaked into the new slot");
        assert!(registry.deliver("a", reply("fresh")));
    }

    #[tokio::test]
    async fn test_guard_unregisters_on_drop() {
        let registry = OutstandingRequestRegistry::new();
        {
            let guard = registry.register_guarded("g").unwrap();
            assert_eq!(guard.req_id(), "g");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_wakes_waiters() {
        let registry = Arc::new(OutstandingRequestRegistry::new());
        registry.register("a").unwrap();
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait("a").await })
        };
        tokio::task::yield_now().await;
        registry.close_all();
        assert_eq!(waiter.await.unwrap(), Err(RpcError::Closed("a".into())));
    }
}
