//! HTTP surface (spec §6.1): exactly the four auth endpoints plus the
//! ambient health/metrics/static-file concerns carried over from the donor
//! regardless of what spec.md's Non-goals exclude. Session lifecycle itself
//! never crosses this surface — it lives entirely on `/ws/client` and
//! `/ws/agent` (`crate::ws`), dispatched over the duplex message protocol.
//!
//! `LoginRateLimiter` and `security_headers` are carried over from the
//! donor's `web.rs` unchanged; only the routes and `AppState` are new.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;

use crate::auth::CredentialStore;
use crate::errors::AuthError;
use crate::registry::AgentRegistry;
use crate::room::Hub;

/// Shared application state.
pub struct AppState {
    pub credentials: Arc<CredentialStore>,
    pub agents: Arc<AgentRegistry>,
    pub hub: Arc<Hub>,
    pub worker_token: String,
    pub web_root: String,
    pub metrics_require_auth: bool,
    pub login_limiter: LoginRateLimiter,
    pub started_at: std::time::Instant,
    pub metrics_logins_attempted: AtomicU64,
    pub metrics_logins_failed: AtomicU64,
}

/// Simple per-key rate limiter for login/setup attempts.
/// Allows at most `max_attempts` in `window_secs`.
/// Bounded to prevent memory exhaustion from enumeration attacks.
/// Performs automatic TTL cleanup every `ttl_cleanup_interval` calls to `check()`.
pub struct LoginRateLimiter {
    attempts: std::sync::Mutex<std::collections::HashMap<String, Vec<std::time::Instant>>>,
    max_attempts: usize,
    window: std::time::Duration,
    max_keys: usize,
    call_count: AtomicU64,
    ttl_cleanup_interval: u64,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: usize, window_secs: u64) -> Self {
        Self {
            attempts: std::sync::Mutex::new(std::collections::HashMap::new()),
            max_attempts,
            window: std::time::Duration::from_secs(window_secs),
            max_keys: 10_000,
            call_count: AtomicU64::new(0),
            ttl_cleanup_interval: 100,
        }
    }

    /// Check if an attempt from this key (IP or username) is allowed.
    /// Returns true if allowed, false if rate-limited.
    pub fn check(&self, key: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = std::time::Instant::now();

        let count = self.call_count.fetch_add(1, Ordering::Relaxed);
        if count.is_multiple_of(self.ttl_cleanup_interval) || attempts.len() > self.max_keys / 2 {
            attempts.retain(|_k, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }

        if attempts.len() >= self.max_keys && !attempts.contains_key(key) {
            return false;
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_attempts {
            return false;
        }

        entry.push(now);
        true
    }

    pub fn clear(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    fn with_cleanup_interval(mut self, interval: u64) -> Self {
        self.ttl_cleanup_interval = interval;
        self
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:",
        ),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );

    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/setup", post(auth_setup))
        .route("/api/auth/login", post(auth_login))
        .route("/api/auth/password", post(auth_password))
        .route("/api/health", get(health_check))
        .route("/api/health/detailed", get(health_check_detailed))
        .route("/metrics", get(metrics))
        .route("/ws/client", get(client_ws_upgrade))
        .route("/ws/agent", get(agent_ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536))
        .with_state(Arc::clone(&state));

    let serve_dir = ServeDir::new(&state.web_root);

    api.fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ")
}

// -- auth (spec §6.1) ------------------------------------------------------

#[derive(Deserialize)]
struct SetupRequest {
    password: String,
    #[serde(rename = "setupToken")]
    setup_token: Option<String>,
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    #[serde(rename = "currentPassword")]
    current_password: String,
    #[serde(rename = "newPassword")]
    new_password: String,
}

async fn auth_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.credentials.needs_setup().await {
        Ok(needs_setup) => Json(json!({ "needs_setup": needs_setup })).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response(),
    }
}

/// `POST /api/auth/setup` — gated on either a loopback peer or a matching
/// `NEXUS_SETUP_TOKEN` (spec §4.1), since the bootstrap admin account has no
/// bearer token yet to protect itself with.
async fn auth_setup(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<SocketAddr>,
    Json(req): Json<SetupRequest>,
) -> impl IntoResponse {
    let allowed = crate::auth::is_loopback_peer(peer.ip())
        || crate::auth::setup_ticket_matches(req.setup_token.as_deref(), state.credentials.setup_ticket());
    if !allowed {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "setup not permitted from this peer" })))
            .into_response();
    }

    if !state.login_limiter.check(&format!("setup:{}", peer.ip())) {
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "too many attempts" }))).into_response();
    }

    match state.credentials.setup(&req.password).await {
        Ok(token) => Json(json!({ "token": token })).into_response(),
        Err(AuthError::AlreadyConfigured) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "already configured" }))).into_response()
        }
        Err(AuthError::WeakPassword) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "password too weak" }))).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "setup failed" }))).into_response(),
    }
}

async fn auth_login(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    state
        .metrics_logins_attempted
        .fetch_add(1, Ordering::Relaxed);

    let key = peer.ip().to_string();
    if !state.login_limiter.check(&key) {
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "too many attempts" }))).into_response();
    }

    match state.credentials.login(&req.password).await {
        Ok(token) => {
            state.login_limiter.clear(&key);
            Json(json!({ "token": token })).into_response()
        }
        Err(_) => {
            state
                .metrics_logins_failed
                .fetch_add(1, Ordering::Relaxed);
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid credentials" }))).into_response()
        }
    }
}

async fn auth_password(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing bearer token" }))).into_response();
    };
    if state.credentials.verify_bearer(token).is_err() {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid or expired token" }))).into_response();
    }

    match state
        .credentials
        .change(&req.current_password, &req.new_password)
        .await
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(AuthError::InvalidCredentials) => {
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "current password is wrong" }))).into_response()
        }
        Err(AuthError::WeakPassword) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "password too weak" }))).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "change failed" }))).into_response(),
    }
}

// -- ambient: health, metrics, websocket upgrades --------------------------

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn health_check_detailed(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing bearer token" }))).into_response();
    };
    if state.credentials.verify_bearer(token).is_err() {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid or expired token" }))).into_response();
    }

    let agents = state.agents.snapshot().await;
    let sessions = state.hub.session_list().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "agents": agents.len(),
        "sessions": sessions.len(),
    }))
    .into_response()
}

async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if state.metrics_require_auth {
        match bearer_token(&headers) {
            Some(token) if state.credentials.verify_bearer(token).is_ok() => {}
            _ => return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
        }
    }

    let active_sessions = state.hub.session_list().await.len();
    let active_agents = state.agents.snapshot().await.len();
    let uptime_secs = state.started_at.elapsed().as_secs();
    let logins_attempted = state.metrics_logins_attempted.load(Ordering::Relaxed);
    let logins_failed = state.metrics_logins_failed.load(Ordering::Relaxed);

    let body = format!(
        "# HELP nexus_active_sessions Number of active sessions\n\
         # TYPE nexus_active_sessions gauge\n\
         nexus_active_sessions {active_sessions}\n\
         \n\
         # HELP nexus_active_agents Number of currently online agents\n\
         # TYPE nexus_active_agents gauge\n\
         nexus_active_agents {active_agents}\n\
         \n\
         # HELP nexus_uptime_seconds Server uptime in seconds\n\
         # TYPE nexus_uptime_seconds gauge\n\
         nexus_uptime_seconds {uptime_secs}\n\
         \n\
         # HELP nexus_total_logins_attempted Total login attempts\n\
         # TYPE nexus_total_logins_attempted counter\n\
         nexus_total_logins_attempted {logins_attempted}\n\
         \n\
         # HELP nexus_total_logins_failed Total failed login attempts\n\
         # TYPE nexus_total_logins_failed counter\n\
         nexus_total_logins_failed {logins_failed}\n"
    );

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn client_ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(2 * 1024 * 1024)
        .on_upgrade(move |socket| crate::ws::handle_client_ws(socket, state.hub.clone(), state.credentials.clone()))
}

async fn agent_ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(2 * 1024 * 1024)
        .on_upgrade(move |socket| crate::ws::handle_agent_ws(socket, state.hub.clone(), state.worker_token.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientRegistry;
    use crate::db::Store;
    use crate::room::HubConfig;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let store = Arc::new(Store::open(":memory:").await.unwrap());
        let credentials = Arc::new(CredentialStore::new(
            Arc::clone(&store),
            "test-secret".to_string(),
            3600,
            1_000,
            Some("ticket123".to_string()),
        ));
        let agents = Arc::new(AgentRegistry::new(15_000));
        let clients = ClientRegistry::new();
        let hub = Hub::new(
            store,
            agents.clone(),
            clients,
            HubConfig {
                output_tail_chars: 50_000,
                output_flush_debounce: std::time::Duration::from_millis(20),
                resize_debounce: std::time::Duration::from_millis(20),
            },
        );

        Arc::new(AppState {
            credentials,
            agents,
            hub,
            worker_token: "worker-secret".to_string(),
            web_root: "./web".to_string(),
            metrics_require_auth: false,
            login_limiter: LoginRateLimiter::new(5, 60),
            started_at: std::time::Instant::now(),
            metrics_logins_attempted: AtomicU64::new(0),
            metrics_logins_failed: AtomicU64::new(0),
        })
    }

    fn router(state: Arc<AppState>) -> Router {
        build_router(state)
    }

    #[tokio::test]
    async fn fresh_instance_needs_setup() {
        let app = router(test_state().await);
        let res = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/auth/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["needs_setup"], true);
    }

    #[tokio::test]
    async fn health_check_is_unauthenticated() {
        let app = router(test_state().await);
        let res = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = router(test_state().await);
        let res = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(res.headers().contains_key("strict-transport-security"));
        assert!(res.headers().contains_key("x-frame-options"));
    }

    #[tokio::test]
    async fn detailed_health_requires_bearer() {
        let app = router(test_state().await);
        let res = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health/detailed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let app = router(test_state().await);
        let res = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("nexus_active_sessions"));
    }

    #[tokio::test]
    async fn rate_limiter_allows_under_limit() {
        let limiter = LoginRateLimiter::new(3, 60);
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
    }

    #[tokio::test]
    async fn rate_limiter_blocks_over_limit() {
        let limiter = LoginRateLimiter::new(3, 60);
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
        assert!(limiter.check("user1"));
        assert!(!limiter.check("user1"));
    }

    #[test]
    fn rate_limiter_ttl_cleanup_removes_expired_entries() {
        let limiter = LoginRateLimiter::new(5, 0).with_cleanup_interval(1);
        for i in 0..50 {
            limiter.check(&format!("attacker-{i}"));
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
        limiter.check("trigger-cleanup");
        assert_eq!(limiter.key_count(), 1);
    }
}
