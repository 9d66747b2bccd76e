//! WebSocket connection handlers for the two link kinds (spec §4.1, §6.2):
//! `/ws/client` (browser UI) and `/ws/agent` (PTY-owning agent process).
//!
//! Grounded in the donor's `signaling.rs` keepalive shape (30s ping / 90s
//! pong timeout, one `tokio::select!` loop per connection) generalised from
//! a single binary-video relay per session to the Hub's JSON dispatch over
//! the full `ClientToHub`/`AgentToHub`/`HubToClient`/`HubToAgent` protocol,
//! and from the donor's single-viewer-kick model to many simultaneous
//! viewers per session (spec §4.7) — there is no kick branch here.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use nexus_protocol::{AgentToHub, ClientId, ClientToHub, HubToAgent, HubToClient, LinkHandshake};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval, timeout};
use uuid::Uuid;

use crate::auth::CredentialStore;
use crate::room::Hub;

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOX_CAPACITY: usize = 256;

async fn recv_handshake(socket: &mut WebSocket) -> Option<LinkHandshake> {
    let frame = timeout(HANDSHAKE_TIMEOUT, socket.recv()).await.ok()??;
    let Message::Text(text) = frame.ok()? else {
        return None;
    };
    serde_json::from_str(&text).ok()
}

/// Handle a client link end to end: handshake, registration, dispatch loop,
/// teardown. The caller has already confirmed the upgrade is a WebSocket
/// request; this owns the connection for its entire lifetime.
pub async fn handle_client_ws(mut socket: WebSocket, hub: Arc<Hub>, credentials: Arc<CredentialStore>) {
    let handshake = match recv_handshake(&mut socket).await {
        Some(LinkHandshake::Client { token }) => token,
        _ => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let claims = match credentials.verify_bearer(&handshake) {
        Ok(claims) => claims,
        Err(_) => {
            let _ = socket
                .send(Message::Text(
                    serde_json::to_string(&HubToClient::Error {
                        message: "invalid or expired bearer token".into(),
                    })
                    .unwrap_or_default()
                    .into(),
                ))
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let client_id: ClientId = Uuid::new_v4();
    let (outbox, mut inbox) = mpsc::channel::<HubToClient>(OUTBOX_CAPACITY);
    hub.clients.register(client_id, outbox).await;
    tracing::info!(%client_id, user = %claims.sub, "client link established");

    let _ = send_json(&mut socket, &HubToClient::AgentList { agents: hub.agents.snapshot().await }).await;
    let _ = send_json(
        &mut socket,
        &HubToClient::SessionList { sessions: hub.session_list().await },
    )
    .await;

    let mut agent_changes = hub.agents.subscribe();
    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%client_id, "client ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            changed = agent_changes.recv() => {
                match changed {
                    Ok(agents) => {
                        if send_json(&mut socket, &HubToClient::AgentList { agents }).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            outgoing = inbox.recv() => {
                match outgoing {
                    Some(msg) => {
                        if send_json(&mut socket, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        dispatch_client_message(&hub, &mut socket, client_id, &text).await;
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
        }
    }

    hub.disconnect_client(client_id).await;
    tracing::info!(%client_id, "client link closed");
}

async fn dispatch_client_message(hub: &Arc<Hub>, socket: &mut WebSocket, client_id: ClientId, text: &str) {
    let message: ClientToHub = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = send_json(
                socket,
                &HubToClient::Error { message: format!("malformed message: {e}") },
            )
            .await;
            return;
        }
    };

    let result = match message {
        ClientToHub::Register => {
            let _ = send_json(socket, &HubToClient::AgentList { agents: hub.agents.snapshot().await }).await;
            Ok(())
        }
        ClientToHub::CreateSession { id, worker_name, worker_key, display_name } => {
            hub.create_session(id, worker_name, worker_key, display_name).await.map_err(|e| e.to_string())
        }
        ClientToHub::CloseSession { session_id } => {
            hub.close_session(&session_id).await.map_err(|e| e.to_string())
        }
        ClientToHub::RenameSession { session_id, display_name } => {
            hub.rename_session(&session_id, display_name).await.map_err(|e| e.to_string())
        }
        ClientToHub::JoinSession { session_id, cols, rows } => {
            match hub.join_session(&session_id, client_id, cols, rows).await {
                Ok(tail) => {
                    let _ = send_json(
                        socket,
                        &HubToClient::Output {
                            worker_id: String::new(),
                            session_id,
                            data: tail,
                        },
                    )
                    .await;
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            }
        }
        ClientToHub::LeaveSession { session_id } => {
            hub.leave_session(&session_id, client_id).await.map_err(|e| e.to_string())
        }
        ClientToHub::GetSessionList => {
            let _ = send_json(socket, &HubToClient::SessionList { sessions: hub.session_list().await }).await;
            Ok(())
        }
        ClientToHub::GetSessionOutput { session_id } => {
            match hub.get_session_output(&session_id).await {
                Ok(data) => {
                    let _ = send_json(
                        socket,
                        &HubToClient::Output { worker_id: String::new(), session_id, data },
                    )
                    .await;
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            }
        }
        ClientToHub::Execute { worker_id, session_id, command } => {
            hub.execute(&worker_id, &session_id, command).await.map_err(|e| e.to_string())
        }
        ClientToHub::Resize { worker_id, session_id, cols, rows } => {
            hub.resize(&worker_id, &session_id, client_id, cols, rows).await.map_err(|e| e.to_string())
        }
    };

    if let Err(message) = result {
        let _ = send_json(socket, &HubToClient::Error { message }).await;
    }
}

/// Handle an agent link end to end. The handshake authenticates the
/// connection against the shared worker credential; the subsequent
/// `AgentToHub::Register` frame supplies the display name used as the
/// agent's key (spec §4.3).
pub async fn handle_agent_ws(mut socket: WebSocket, hub: Arc<Hub>, worker_token: String) {
    let handshake = match recv_handshake(&mut socket).await {
        Some(LinkHandshake::Agent { credential }) => credential,
        _ => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // An empty worker_token means the hub was started with
    // ALLOW_UNAUTHENTICATED_WORKERS=true and no WORKER_TOKEN configured; any
    // credential is accepted in that mode.
    if !worker_token.is_empty()
        && !crate::auth::constant_time_eq(handshake.as_bytes(), worker_token.as_bytes())
    {
        tracing::warn!("agent link rejected: bad credential");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let name = match timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AgentToHub>(&text) {
            Ok(AgentToHub::Register { name }) => name,
            _ => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        },
        _ => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // The registry key is case-folded so two agents differing only in case
    // collapse onto the same stable key (spec §3); the original casing is
    // kept as the display name shown to clients.
    let key = name.to_lowercase();

    let (outbox, mut inbox) = mpsc::channel::<HubToAgent>(OUTBOX_CAPACITY);
    hub.agents.register(key.clone(), name.clone(), outbox).await;
    tracing::info!(agent = %name, "agent link established");

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(agent = %name, "agent ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            outgoing = inbox.recv() => {
                match outgoing {
                    Some(msg) => {
                        if send_agent_json(&mut socket, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        dispatch_agent_message(&hub, &key, &text).await;
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
        }
    }

    hub.agents.remove(&key).await;
    tracing::info!(agent = %name, "agent link closed");
}

async fn dispatch_agent_message(hub: &Arc<Hub>, key: &str, text: &str) {
    let message: AgentToHub = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(agent = %key, "malformed agent frame: {e}");
            return;
        }
    };

    match message {
        AgentToHub::Register { .. } => {
            // Re-registration mid-connection is a no-op; the key was fixed
            // at link setup.
        }
        AgentToHub::Heartbeat => {
            hub.agents.heartbeat(key).await;
        }
        AgentToHub::Output { session_id, output } => {
            hub.receive_output(&session_id, output).await;
        }
        AgentToHub::SessionShellExited { session_id, exit_code, signal } => {
            tracing::info!(agent = %key, %session_id, ?exit_code, ?signal, "shell exited");
        }
    }
}

async fn send_json(socket: &mut WebSocket, msg: &HubToClient) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}

async fn send_agent_json(socket: &mut WebSocket, msg: &HubToAgent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
