//! Registry of currently connected client links, keyed by per-connection
//! [`ClientId`]. This is the fan-out target for both global broadcasts
//! (`agent_list`, `session_list`) and per-room output delivery — the latter
//! iterates a room's viewer set and looks up each viewer's outbox here,
//! rather than each room owning its own broadcast channel, so a lagging
//! viewer on one session can never affect delivery to another.
//!
//! Grounded in the same `Arc<RwLock<HashMap<...>>>` shape as
//! [`crate::registry::AgentRegistry`] (the donor's `ChannelRegistry`
//! pattern), specialised to the Hub's bounded-outbound-queue-per-connection
//! backpressure rule (spec §5): `try_send` on a full queue drops the
//! connection rather than blocking the sender.

use std::collections::HashMap;
use std::sync::Arc;

use nexus_protocol::{ClientId, HubToClient};
use tokio::sync::{RwLock, mpsc};

pub type ClientOutbox = mpsc::Sender<HubToClient>;

pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientOutbox>>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, id: ClientId, outbox: ClientOutbox) {
        self.clients.write().await.insert(id, outbox);
    }

    pub async fn remove(&self, id: ClientId) {
        self.clients.write().await.remove(&id);
    }

    /// Send to one client. Returns `false` if the client is unknown or its
    /// outbound queue is full/closed (spec §5: queue overflow closes the
    /// connection rather than blocking — the receive side of the queue, not
    /// this call, is what tears the connection down).
    pub async fn send_to(&self, id: ClientId, msg: HubToClient) -> bool {
        let outbox = { self.clients.read().await.get(&id).cloned() };
        match outbox {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Fan out to an explicit set of client ids (a room's viewer set).
    pub async fn send_to_many(&self, ids: impl Iterator<Item = ClientId>, msg: HubToClient) {
        let clients = self.clients.read().await;
        for id in ids {
            if let Some(tx) = clients.get(&id) {
                let _ = tx.try_send(msg.clone());
            }
        }
    }

    /// Broadcast to every connected client (`agent_list`, `session_list`).
    pub async fn broadcast(&self, msg: HubToClient) {
        let clients = self.clients.read().await;
        for tx in clients.values() {
            let _ = tx.try_send(msg.clone());
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn send_to_unknown_client_returns_false() {
        let registry = ClientRegistry::new();
        let delivered = registry
            .send_to(Uuid::new_v4(), HubToClient::Error { message: "x".into() })
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn send_to_registered_client_delivers() {
        let registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(id, tx).await;
        let delivered = registry
            .send_to(id, HubToClient::Error { message: "hi".into() })
            .await;
        assert!(delivered);
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, HubToClient::Error { message } if message == "hi"));
    }

    #[tokio::test]
    async fn removed_client_is_no_longer_reachable() {
        let registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(id, tx).await;
        registry.remove(id).await;
        assert!(!registry.send_to(id, HubToClient::Error { message: "x".into() }).await);
    }

    #[tokio::test]
    async fn full_outbound_queue_reports_failed_delivery() {
        let registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(id, tx).await;
        assert!(registry.send_to(id, HubToClient::Error { message: "1".into() }).await);
        // Second send with nothing draining the receiver overflows the
        // bounded queue and must report failed delivery, not block.
        assert!(!registry.send_to(id, HubToClient::Error { message: "2".into() }).await);
    }

    #[tokio::test]
    async fn broadcast_reaches_all_registered_clients() {
        let registry = ClientRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.register(Uuid::new_v4(), tx1).await;
        registry.register(Uuid::new_v4(), tx2).await;
        registry
            .broadcast(HubToClient::Error { message: "all".into() })
            .await;
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
