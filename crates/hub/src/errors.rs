//! Domain-level error taxonomy (spec §7). These cross API/connection
//! boundaries and therefore need a stable shape clients and tests can match
//! on, unlike the `anyhow::Result` used for startup/IO plumbing elsewhere.

use thiserror::Error;

/// Authentication failures. The peer recovers by re-authenticating; none of
/// these are fatal to the process.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("credential store is not configured")]
    NotConfigured,
    #[error("credential store is already configured")]
    AlreadyConfigured,
    #[error("password must be at least 8 characters")]
    WeakPassword,
    #[error("bearer token missing, malformed, or expired")]
    InvalidBearer,
    #[error("unauthorised agent credential")]
    UnauthorisedAgent,
    #[error("setup is only allowed from a loopback peer or with a valid setup ticket")]
    SetupNotAllowed,
}

/// Violations of the wire protocol. The offending frame is dropped; the link
/// is closed after repeated violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame type")]
    UnknownFrame,
    #[error("frame received from the wrong role")]
    WrongRole,
    #[error("frame payload exceeds the size cap")]
    OversizePayload,
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
}

/// Routing failures. Surfaced to the originating client as an `error` frame;
/// never fatal.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("agent '{0}' is not online")]
    AgentOffline(String),
    #[error("session '{0}' does not exist")]
    UnknownSession(String),
    #[error("access to session '{0}' is denied")]
    AccessDenied(String),
}

/// Resource exhaustion. The connection responsible is closed and its state
/// cleaned up; never fatal to the process as a whole.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("outbound queue overflowed")]
    QueueOverflow,
    #[error("session was deleted before the append could be applied")]
    SessionGone,
}

/// Errors that abort the process with a non-zero exit code (spec §6.4).
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("required secret is not configured: {0}")]
    MissingSecret(&'static str),
    #[error("failed to open persistent storage: {0}")]
    StorageUnavailable(#[from] sqlx::Error),
    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] std::io::Error),
}

impl FatalError {
    /// Process exit code per spec §6.4: 1 for configuration errors, 2 for an
    /// unrecoverable listen failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::BindFailed(_) => 2,
            FatalError::MissingSecret(_) | FatalError::StorageUnavailable(_) => 1,
        }
    }
}
