use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, globally unique session identifier. Assigned by the client that
/// creates the session, not generated by the Hub — the Hub only validates
/// uniqueness.
pub type SessionId = String;

/// Stable, case-insensitive key identifying an agent. Two agent connections
/// presenting the same display name collapse onto one key.
pub type AgentKey = String;

/// Identifies one client connection to the Hub, for the lifetime of that
/// connection.
pub type ClientId = Uuid;

/// Per-link handshake, sent as the first frame after a duplex connection is
/// established and before any `ClientToHub`/`AgentToHub` message is
/// accepted.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkHandshake {
    /// Client link, authenticated by a bearer token issued by the credential
    /// store.
    Client { token: String },
    /// Agent link, authenticated by the shared worker credential.
    Agent { credential: String },
}

impl std::fmt::Debug for LinkHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkHandshake::Client { .. } => f
                .debug_struct("LinkHandshake::Client")
                .field("token", &"[REDACTED]")
                .finish(),
            LinkHandshake::Agent { .. } => f
                .debug_struct("LinkHandshake::Agent")
                .field("credential", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Messages a client sends to the Hub after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientToHub {
    /// Finalise registration; triggers an initial `agent_list` push.
    Register,
    CreateSession {
        id: SessionId,
        worker_name: AgentKey,
        worker_key: AgentKey,
        display_name: String,
    },
    CloseSession {
        session_id: SessionId,
    },
    RenameSession {
        session_id: SessionId,
        display_name: String,
    },
    JoinSession {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    LeaveSession {
        session_id: SessionId,
    },
    GetSessionList,
    GetSessionOutput {
        session_id: SessionId,
    },
    /// `command` is raw PTY input (keystrokes or pasted text), length-capped
    /// by the Hub before it is forwarded to the owning agent.
    Execute {
        worker_id: AgentKey,
        session_id: SessionId,
        command: String,
    },
    Resize {
        worker_id: AgentKey,
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
}

/// Messages an agent sends to the Hub after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentToHub {
    Register {
        name: AgentKey,
    },
    Heartbeat,
    /// Raw PTY bytes, decoded lossily. The PTY stream is not guaranteed to
    /// align with UTF-8 boundaries at arbitrary chunk edges; the terminal
    /// emulator on the client side re-syncs regardless.
    Output {
        session_id: SessionId,
        output: String,
    },
    SessionShellExited {
        session_id: SessionId,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: AgentKey,
    pub name: String,
    pub status: AgentStatus,
    /// Unix millis of the last heartbeat or registration.
    pub last_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub worker_name: AgentKey,
    pub worker_key: AgentKey,
    pub display_name: String,
    pub created_at: u64,
    pub last_active_at: u64,
}

/// Messages the Hub sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubToClient {
    AgentList { agents: Vec<AgentSummary> },
    SessionList { sessions: Vec<SessionSummary> },
    SessionClosed { session_id: SessionId },
    Output {
        worker_id: AgentKey,
        session_id: SessionId,
        data: String,
    },
    Error { message: String },
}

/// Messages the Hub sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubToAgent {
    Execute {
        client_id: ClientId,
        session_id: SessionId,
        command: String,
    },
    Resize {
        client_id: ClientId,
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    KillSession {
        session_id: SessionId,
    },
    ClientDisconnect {
        client_id: ClientId,
    },
}
