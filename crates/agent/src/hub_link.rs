//! The agent's single outbound connection to the Hub (spec §4.5): connect,
//! handshake, heartbeat, dispatch. Grounded in the donor's `signaling.rs`
//! (`run_signaling`'s reconnect loop, `build_tls_connector`'s native-root +
//! pinned-cert setup, `connect_and_handle`'s split-stream `tokio::select!`)
//! but generalized from a single video/input link per session to one
//! long-lived JSON link per agent process carrying every session it owns,
//! and with the backoff ceiling lowered from the donor's 60s to the spec's
//! 30s (§4.5).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use nexus_protocol::{AgentToHub, HubToAgent, LinkHandshake};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::pty::{PtyRegistry, ShellExit};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub struct LinkConfig {
    pub hub_url: String,
    pub name: String,
    pub credential: Option<String>,
    pub tls_cert_path: Option<String>,
}

/// Run the hub link forever, reconnecting with exponential backoff on any
/// error. Returns only if the hub explicitly closes the connection and the
/// caller chooses not to retry — in practice this never returns.
pub async fn run(
    config: LinkConfig,
    registry: Arc<PtyRegistry>,
    mut output_rx: mpsc::Receiver<(String, String)>,
    mut exit_rx: mpsc::Receiver<ShellExit>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        info!(url = %config.hub_url, "connecting to hub");
        match connect_and_handle(&config, &registry, &mut output_rx, &mut exit_rx).await {
            Ok(()) => {
                info!("hub link closed cleanly");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!("hub link error: {e:#}");
            }
        }
        info!(seconds = backoff.as_secs(), "reconnecting to hub after backoff");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> =
                    rustls_pemfile::certs(&mut pem_data.as_slice()).filter_map(|r| r.ok()).collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("failed to add pinned cert to root store: {e}");
                    } else {
                        info!(path = cert_path, "pinned hub certificate");
                    }
                }
            }
            Err(e) => {
                warn!("failed to read TLS cert from {cert_path}: {e}, falling back to system roots");
            }
        }
    }

    let tls_config =
        rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

async fn connect_and_handle(
    config: &LinkConfig,
    registry: &Arc<PtyRegistry>,
    output_rx: &mut mpsc::Receiver<(String, String)>,
    exit_rx: &mut mpsc::Receiver<ShellExit>,
) -> anyhow::Result<()> {
    let connector = build_tls_connector(config.tls_cert_path.as_deref());
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(2 * 1024 * 1024);

    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        &config.hub_url,
        Some(ws_config),
        false,
        Some(connector),
    )
    .await
    .context("hub websocket connection failed")?;

    info!("connected to hub, sending handshake");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let handshake = LinkHandshake::Agent { credential: config.credential.clone().unwrap_or_default() };
    ws_tx.send(Message::Text(serde_json::to_string(&handshake)?.into())).await?;
    let register = AgentToHub::Register { name: config.name.clone() };
    ws_tx.send(Message::Text(serde_json::to_string(&register)?.into())).await?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let msg = serde_json::to_string(&AgentToHub::Heartbeat)?;
                ws_tx.send(Message::Text(msg.into())).await?;
            }
            Some((session_id, output)) = output_rx.recv() => {
                let msg = serde_json::to_string(&AgentToHub::Output { session_id, output })?;
                ws_tx.send(Message::Text(msg.into())).await?;
            }
            Some(exit) = exit_rx.recv() => {
                let msg = serde_json::to_string(&AgentToHub::SessionShellExited {
                    session_id: exit.session_id,
                    exit_code: exit.exit_code,
                    signal: exit.signal,
                })?;
                ws_tx.send(Message::Text(msg.into())).await?;
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_hub_message(registry, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws_tx.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
        }
    }
}

async fn dispatch_hub_message(registry: &Arc<PtyRegistry>, text: &str) {
    let message: HubToAgent = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("malformed message from hub: {e}");
            return;
        }
    };

    match message {
        HubToAgent::Execute { session_id, command, .. } => match registry.get_or_spawn(&session_id).await {
            Ok(session) => {
                if let Err(e) = session.write_input(command.as_bytes()).await {
                    warn!(%session_id, "failed to write to pty: {e}");
                }
            }
            Err(e) => warn!(%session_id, "failed to spawn pty: {e}"),
        },
        HubToAgent::Resize { session_id, cols, rows, .. } => match registry.get_or_spawn(&session_id).await {
            Ok(session) => session.resize(cols, rows).await,
            Err(e) => warn!(%session_id, "failed to spawn pty for resize: {e}"),
        },
        HubToAgent::KillSession { session_id } => {
            registry.kill(&session_id).await;
        }
        HubToAgent::ClientDisconnect { client_id } => {
            // Viewer bookkeeping lives entirely on the Hub; the agent has no
            // per-viewer state to reconcile here.
            tracing::debug!(%client_id, "client disconnected from a session this agent owns");
        }
    }
}
