//! The Hub multiplexer (C5, spec §4.4) — the heart of the system. A [`Hub`]
//! owns the session registry (in-memory `Room`s mirrored into [`crate::db`]),
//! the [`crate::registry::AgentRegistry`], and the [`crate::clients::ClientRegistry`],
//! and implements the routing matrix end to end.
//!
//! This is the direct generalisation of the donor's `signaling.rs`
//! `SignalingChannel{to_agent, to_browser, video_frames}` broadcast triple:
//! the donor's one-browser-per-session model becomes a `Room.viewers` map
//! (many legitimate simultaneous viewers, spec §4.7), and the donor's binary
//! `video_frames` channel (with `FRAME_MAGIC` validation) has no counterpart
//! — PTY output is JSON-framed text per spec §6.2 — and was dropped in the
//! final trim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nexus_protocol::{
    AgentKey, ClientId, HubToAgent, HubToClient, SessionId, SessionSummary,
};
use tokio::sync::{Mutex, RwLock, broadcast};
use uuid::Uuid;

use crate::clients::ClientRegistry;
use crate::db::Store;
use crate::errors::RoutingError;
use crate::reconciler::{self, Viewport};
use crate::registry::AgentRegistry;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// In-memory state for one persistent session (spec §3's Session entity,
/// minus durable storage which lives in [`Store`]). The output tail here is
/// authoritative while the Hub is alive; [`Store`] only sees it on the
/// coalesced debounce or on graceful shutdown (spec §4.2).
struct Room {
    id: SessionId,
    worker_key: AgentKey,
    worker_name: AgentKey,
    display_name: String,
    created_at: i64,
    last_active_at: i64,
    tail: String,
    /// Set when the tail has unflushed bytes; cleared by the flusher.
    dirty_since: Option<Instant>,
    viewers: HashMap<ClientId, Viewport>,
    applied_size: Option<Viewport>,
    /// Debounce generation for viewport reconciliation (spec §4.7: coalesce
    /// resize storms to at most one resize per 100ms per session).
    resize_generation: u64,
}

impl Room {
    fn snapshot(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            worker_name: self.worker_name.clone(),
            worker_key: self.worker_key.clone(),
            display_name: self.display_name.clone(),
            created_at: self.created_at as u64,
            last_active_at: self.last_active_at as u64,
        }
    }

    fn append_output_bounded(&mut self, bytes: &str, tail_chars: usize) {
        self.tail.push_str(bytes);
        if self.tail.chars().count() > tail_chars {
            let drop = self.tail.chars().count() - tail_chars;
            self.tail = self.tail.chars().skip(drop).collect();
        }
        self.last_active_at = now_secs();
        self.dirty_since.get_or_insert(Instant::now());
    }
}

pub struct HubConfig {
    pub output_tail_chars: usize,
    pub output_flush_debounce: Duration,
    pub resize_debounce: Duration,
}

pub struct Hub {
    store: Arc<Store>,
    pub agents: Arc<AgentRegistry>,
    pub clients: Arc<ClientRegistry>,
    rooms: RwLock<HashMap<SessionId, Arc<Mutex<Room>>>>,
    session_list_changes: broadcast::Sender<()>,
    config: HubConfig,
}

impl Hub {
    pub fn new(
        store: Arc<Store>,
        agents: Arc<AgentRegistry>,
        clients: Arc<ClientRegistry>,
        config: HubConfig,
    ) -> Arc<Self> {
        let (session_list_changes, _) = broadcast::channel(16);
        Arc::new(Self {
            store,
            agents,
            clients,
            rooms: RwLock::new(HashMap::new()),
            session_list_changes,
            config,
        })
    }

    /// Restore rooms from durable storage at startup (spec §8 property 5:
    /// sessions survive a hub restart).
    pub async fn restore_from_store(&self) -> anyhow::Result<usize> {
        let rows = self.store.load_all_sessions().await?;
        let mut rooms = self.rooms.write().await;
        let count = rows.len();
        for row in rows {
            rooms.insert(
                row.id.clone(),
                Arc::new(Mutex::new(Room {
                    id: row.id,
                    worker_key: row.worker_key,
                    worker_name: row.worker_name,
                    display_name: row.display_name,
                    created_at: row.created_at,
                    last_active_at: row.last_active_at,
                    tail: row.output,
                    dirty_since: None,
                    viewers: HashMap::new(),
                    applied_size: None,
                    resize_generation: 0,
                })),
            );
        }
        Ok(count)
    }

    pub async fn session_list(&self) -> Vec<SessionSummary> {
        let rooms = self.rooms.read().await;
        let mut list = Vec::with_capacity(rooms.len());
        for room in rooms.values() {
            list.push(room.lock().await.snapshot());
        }
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    async fn broadcast_session_list(&self) {
        let list = self.session_list().await;
        self.clients
            .broadcast(HubToClient::SessionList { sessions: list })
            .await;
    }

    // -- routing matrix (spec §4.4) --------------------------------------

    /// `create_session` — client only. Invariant: a session's agent key
    /// never changes once created (spec §3).
    pub async fn create_session(
        &self,
        id: SessionId,
        worker_name: AgentKey,
        worker_key: AgentKey,
        display_name: String,
    ) -> Result<(), RoutingError> {
        // Case-folded to match the agent registry's key (spec §3: agent keys
        // are a case-insensitive collapse of the display name).
        let worker_key = worker_key.to_lowercase();
        {
            let rooms = self.rooms.read().await;
            if rooms.contains_key(&id) {
                return Err(RoutingError::AccessDenied(format!(
                    "session '{id}' already exists"
                )));
            }
        }

        self.store
            .create_session(&id, &worker_name, &worker_key, &display_name)
            .await
            .map_err(|_| RoutingError::UnknownSession(id.clone()))?;

        let now = now_secs();
        let room = Arc::new(Mutex::new(Room {
            id: id.clone(),
            worker_key,
            worker_name,
            display_name,
            created_at: now,
            last_active_at: now,
            tail: String::new(),
            dirty_since: None,
            viewers: HashMap::new(),
            applied_size: None,
            resize_generation: 0,
        }));

        {
            let mut rooms = self.rooms.write().await;
            rooms.insert(id, room);
        }
        self.broadcast_session_list().await;
        Ok(())
    }

    /// `close_session` — replicated to every client and to the owning agent
    /// (spec scenario S5). The agent honours the kill flag and does not
    /// respawn.
    pub async fn close_session(&self, id: &str) -> Result<(), RoutingError> {
        let room = {
            let mut rooms = self.rooms.write().await;
            rooms.remove(id)
        }
        .ok_or_else(|| RoutingError::UnknownSession(id.to_string()))?;

        let worker_key = { room.lock().await.worker_key.clone() };

        let _ = self.store.delete_session(id).await;

        if let Some(outbox) = self.agents.get_outbox(&worker_key).await {
            let _ = outbox
                .send(HubToAgent::KillSession {
                    session_id: id.to_string(),
                })
                .await;
        }

        self.clients
            .broadcast(HubToClient::SessionClosed {
                session_id: id.to_string(),
            })
            .await;
        self.broadcast_session_list().await;
        Ok(())
    }

    pub async fn rename_session(&self, id: &str, display_name: String) -> Result<(), RoutingError> {
        let room = self.get_room(id).await?;
        {
            let mut room = room.lock().await;
            room.display_name = display_name.clone();
        }
        let _ = self.store.rename_session(id, &display_name).await;
        self.broadcast_session_list().await;
        Ok(())
    }

    /// `join_session` — adds the viewer attachment, recomputes the
    /// reconciler, and returns the current output tail for hydration.
    pub async fn join_session(
        &self,
        id: &str,
        client_id: ClientId,
        cols: u16,
        rows: u16,
    ) -> Result<String, RoutingError> {
        let room = self.get_room(id).await?;
        let (tail, worker_key) = {
            let mut room = room.lock().await;
            room.viewers.insert(client_id, Viewport { cols, rows });
            (room.tail.clone(), room.worker_key.clone())
        };
        self.schedule_reconcile(id.to_string(), room, worker_key)
            .await;
        Ok(tail)
    }

    pub async fn leave_session(&self, id: &str, client_id: ClientId) -> Result<(), RoutingError> {
        let room = self.get_room(id).await?;
        let worker_key = {
            let mut room = room.lock().await;
            room.viewers.remove(&client_id);
            room.worker_key.clone()
        };
        self.schedule_reconcile(id.to_string(), room, worker_key)
            .await;
        Ok(())
    }

    /// Drop every attachment belonging to one client connection, e.g. on
    /// disconnect. Notifies the owning agents via `client_disconnect`.
    pub async fn disconnect_client(&self, client_id: ClientId) {
        self.clients.remove(client_id).await;

        let rooms: Vec<Arc<Mutex<Room>>> = { self.rooms.read().await.values().cloned().collect() };
        for room in rooms {
            let (was_viewer, id, worker_key) = {
                let mut room = room.lock().await;
                let was_viewer = room.viewers.remove(&client_id).is_some();
                (was_viewer, room.id.clone(), room.worker_key.clone())
            };
            if was_viewer {
                if let Some(outbox) = self.agents.get_outbox(&worker_key).await {
                    let _ = outbox.send(HubToAgent::ClientDisconnect { client_id }).await;
                }
                self.schedule_reconcile(id, room, worker_key).await;
            }
        }
    }

    /// `execute` — client keystrokes routed to the single owning agent.
    pub async fn execute(
        &self,
        worker_id: &str,
        session_id: &str,
        command: String,
    ) -> Result<(), RoutingError> {
        const MAX_COMMAND_LEN: usize = 4096;
        if command.len() > MAX_COMMAND_LEN {
            return Err(RoutingError::AccessDenied("command too large".into()));
        }

        let worker_id = worker_id.to_lowercase();
        let room = self.get_room(session_id).await?;
        {
            let room = room.lock().await;
            if room.worker_key != worker_id {
                return Err(RoutingError::AccessDenied(session_id.to_string()));
            }
        }

        let outbox = self
            .agents
            .get_outbox(&worker_id)
            .await
            .ok_or_else(|| RoutingError::AgentOffline(worker_id.clone()))?;

        outbox
            .send(HubToAgent::Execute {
                client_id: Uuid::nil(),
                session_id: session_id.to_string(),
                command,
            })
            .await
            .map_err(|_| RoutingError::AgentOffline(worker_id.to_string()))
    }

    /// `resize` — records the viewer's own reported viewport, then lets the
    /// reconciler decide the size actually sent to the agent.
    pub async fn resize(
        &self,
        worker_id: &str,
        session_id: &str,
        client_id: ClientId,
        cols: u16,
        rows: u16,
    ) -> Result<(), RoutingError> {
        let worker_id = worker_id.to_lowercase();
        let room = self.get_room(session_id).await?;
        let worker_key = {
            let mut room = room.lock().await;
            if room.worker_key != worker_id {
                return Err(RoutingError::AccessDenied(session_id.to_string()));
            }
            room.viewers.insert(client_id, Viewport { cols, rows });
            room.worker_key.clone()
        };
        self.schedule_reconcile(session_id.to_string(), room, worker_key)
            .await;
        Ok(())
    }

    /// `output` — agent only. Appended to the tail and fanned out to every
    /// client currently in the session's room (never a global broadcast).
    pub async fn receive_output(&self, session_id: &str, bytes: String) {
        let Some(room) = self.try_get_room(session_id).await else {
            return;
        };

        let (viewer_ids, worker_id) = {
            let mut room = room.lock().await;
            room.append_output_bounded(&bytes, self.config.output_tail_chars);
            (
                room.viewers.keys().copied().collect::<Vec<_>>(),
                room.worker_key.clone(),
            )
        };

        self.clients
            .send_to_many(
                viewer_ids.into_iter(),
                HubToClient::Output {
                    worker_id,
                    session_id: session_id.to_string(),
                    data: bytes,
                },
            )
            .await;
    }

    pub async fn get_session_output(&self, session_id: &str) -> Result<String, RoutingError> {
        let room = self.get_room(session_id).await?;
        Ok(room.lock().await.tail.clone())
    }

    // -- reconciliation / debounce (spec §4.7) ---------------------------

    async fn schedule_reconcile(&self, session_id: SessionId, room: Arc<Mutex<Room>>, worker_key: AgentKey) {
        let generation = {
            let mut guard = room.lock().await;
            guard.resize_generation += 1;
            guard.resize_generation
        };

        let agents = Arc::clone(&self.agents);
        let debounce = self.config.resize_debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            let mut guard = room.lock().await;
            if guard.resize_generation != generation {
                // A newer event superseded this one; it will run its own
                // debounce window.
                return;
            }

            let Some(target) = reconciler::reconcile(&guard.viewers) else {
                return;
            };
            if guard.applied_size == Some(target) {
                return;
            }
            guard.applied_size = Some(target);
            drop(guard);

            if let Some(outbox) = agents.get_outbox(&worker_key).await {
                let _ = outbox
                    .send(HubToAgent::Resize {
                        client_id: Uuid::nil(),
                        session_id,
                        cols: target.cols,
                        rows: target.rows,
                    })
                    .await;
            }
        });
    }

    // -- flush / shutdown --------------------------------------------------

    /// Flush every room whose tail has been dirty for at least the
    /// configured debounce window. Intended to be called from a periodic
    /// background task.
    pub async fn flush_due(&self) {
        let rooms: Vec<Arc<Mutex<Room>>> = { self.rooms.read().await.values().cloned().collect() };
        for room in rooms {
            let to_write = {
                let mut guard = room.lock().await;
                match guard.dirty_since {
                    Some(since) if since.elapsed() >= self.config.output_flush_debounce => {
                        guard.dirty_since = None;
                        Some((guard.id.clone(), guard.tail.clone(), guard.last_active_at))
                    }
                    _ => None,
                }
            };
            if let Some((id, tail, last_active)) = to_write {
                let _ = self.store.write_output(&id, &tail).await;
                let _ = self.store.set_last_active(&id, last_active).await;
            }
        }
    }

    /// Flush every dirty room unconditionally. Called on graceful shutdown.
    pub async fn flush_all(&self) {
        let rooms: Vec<Arc<Mutex<Room>>> = { self.rooms.read().await.values().cloned().collect() };
        for room in rooms {
            let (id, tail, last_active, dirty) = {
                let mut guard = room.lock().await;
                let dirty = guard.dirty_since.take().is_some();
                (guard.id.clone(), guard.tail.clone(), guard.last_active_at, dirty)
            };
            if dirty {
                let _ = self.store.write_output(&id, &tail).await;
                let _ = self.store.set_last_active(&id, last_active).await;
            }
        }
    }

    async fn get_room(&self, id: &str) -> Result<Arc<Mutex<Room>>, RoutingError> {
        self.try_get_room(id)
            .await
            .ok_or_else(|| RoutingError::UnknownSession(id.to_string()))
    }

    async fn try_get_room(&self, id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn test_hub() -> Arc<Hub> {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        let agents = Arc::new(AgentRegistry::new(15_000));
        let clients = ClientRegistry::new();
        Hub::new(
            store,
            agents,
            clients,
            HubConfig {
                output_tail_chars: 50_000,
                output_flush_debounce: Duration::from_millis(20),
                resize_debounce: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn create_then_list_contains_session() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        let list = hub.session_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "s-1");
    }

    #[tokio::test]
    async fn create_then_close_returns_to_empty() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        hub.close_session("s-1").await.unwrap();
        assert!(hub.session_list().await.is_empty());
    }

    #[tokio::test]
    async fn rename_is_idempotent() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        hub.rename_session("s-1", "renamed".into()).await.unwrap();
        hub.rename_session("s-1", "renamed".into()).await.unwrap();
        let list = hub.session_list().await;
        assert_eq!(list[0].display_name, "renamed");
    }

    #[tokio::test]
    async fn execute_against_offline_agent_is_a_routing_error() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        let err = hub.execute("worker1", "s-1", "ls\n".into()).await.unwrap_err();
        assert!(matches!(err, RoutingError::AgentOffline(_)));
    }

    #[tokio::test]
    async fn execute_against_unknown_session_is_a_routing_error() {
        let hub = test_hub().await;
        let err = hub
            .execute("worker1", "does-not-exist", "ls\n".into())
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn oversize_command_is_rejected() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        let big = "a".repeat(5000);
        let err = hub.execute("worker1", "s-1", big).await.unwrap_err();
        assert!(matches!(err, RoutingError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn execute_with_registered_online_agent_delivers() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        hub.agents.register("worker1".into(), "worker1".into(), tx).await;
        hub.execute("worker1", "s-1", "echo hi\n".into()).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, HubToAgent::Execute { command, .. } if command == "echo hi\n"));
    }

    #[tokio::test]
    async fn join_session_returns_current_tail_for_hydration() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        hub.receive_output("s-1", "hello\n".into()).await;
        let tail = hub
            .join_session("s-1", Uuid::new_v4(), 80, 24)
            .await
            .unwrap();
        assert_eq!(tail, "hello\n");
    }

    #[tokio::test]
    async fn output_is_only_delivered_to_attached_viewers() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();

        let attached = Uuid::new_v4();
        let (tx_attached, mut rx_attached) = mpsc::channel(16);
        hub.clients.register(attached, tx_attached).await;
        hub.join_session("s-1", attached, 80, 24).await.unwrap();

        let not_attached = Uuid::new_v4();
        let (tx_other, mut rx_other) = mpsc::channel(16);
        hub.clients.register(not_attached, tx_other).await;

        hub.receive_output("s-1", "hello\n".into()).await;

        let msg = rx_attached.recv().await.unwrap();
        assert!(matches!(msg, HubToClient::Output { data, .. } if data == "hello\n"));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn output_tail_is_bounded() {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        let agents = Arc::new(AgentRegistry::new(15_000));
        let clients = ClientRegistry::new();
        let hub = Hub::new(
            store,
            agents,
            clients,
            HubConfig {
                output_tail_chars: 10,
                output_flush_debounce: Duration::from_secs(60),
                resize_debounce: Duration::from_millis(20),
            },
        );
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        hub.receive_output("s-1", "0123456789".into()).await;
        hub.receive_output("s-1", "abcde".into()).await;
        let tail = hub.get_session_output("s-1").await.unwrap();
        assert_eq!(tail.len(), 10);
        assert_eq!(tail, "56789abcde");
    }

    #[tokio::test]
    async fn two_viewers_reconcile_to_minimum_dimensions() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        hub.agents.register("worker1".into(), "worker1".into(), tx).await;

        hub.join_session("s-1", Uuid::new_v4(), 80, 24).await.unwrap();
        hub.join_session("s-1", Uuid::new_v4(), 100, 40).await.unwrap();

        // Debounce window is 20ms; wait past it for the coalesced resize.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let msg = rx.recv().await.unwrap();
        match msg {
            HubToAgent::Resize { cols, rows, .. } => {
                assert_eq!((cols, rows), (80, 24));
            }
            _ => panic!("expected Resize"),
        }
    }

    #[tokio::test]
    async fn close_session_notifies_owning_agent_to_kill() {
        let hub = test_hub().await;
        hub.create_session("s-1".into(), "worker1".into(), "worker1".into(), "tty".into())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        hub.agents.register("worker1".into(), "worker1".into(), tx).await;
        hub.close_session("s-1").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, HubToAgent::KillSession { session_id } if session_id == "s-1"));
    }

    #[tokio::test]
    async fn restore_from_store_repopulates_rooms() {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        store
            .create_session("s-2", "worker1", "worker1", "tty")
            .await
            .unwrap();
        store.write_output("s-2", "line1\nline2\n").await.unwrap();

        let agents = Arc::new(AgentRegistry::new(15_000));
        let clients = ClientRegistry::new();
        let hub = Hub::new(
            store,
            agents,
            clients,
            HubConfig {
                output_tail_chars: 50_000,
                output_flush_debounce: Duration::from_millis(20),
                resize_debounce: Duration::from_millis(20),
            },
        );
        let restored = hub.restore_from_store().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(hub.get_session_output("s-2").await.unwrap(), "line1\nline2\n");
    }
}
