mod auth;
mod clients;
mod config;
mod db;
mod errors;
mod reconciler;
mod registry;
mod room;
mod tls;
mod web;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::auth::CredentialStore;
use crate::clients::ClientRegistry;
use crate::db::Store;
use crate::errors::FatalError;
use crate::registry::AgentRegistry;
use crate::room::{Hub, HubConfig};
use crate::web::{AppState, LoginRateLimiter};

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/nexus.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

fn bail_fatal(err: FatalError) -> ! {
    tracing::error!("{err}");
    std::process::exit(err.exit_code());
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    if !std::path::Path::new(&config.server.web_root).is_dir() {
        tracing::warn!(
            "Web root '{}' does not exist — the UI will not load. \
             Point server.web_root at a built client or set it in the config.",
            config.server.web_root
        );
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("Invalid bind address")?;

    let tls_result = tls::build_tls_config(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
    )?;
    let tls_acceptor = tls::make_acceptor(tls_result.config);

    // In production an absent secret is a fatal boot error, not an
    // auto-generate-and-persist convenience (spec §4.1/§6.4). NEXUS_ENV is
    // the explicit signal for that; anything else (including unset, the
    // common case for local/dev/test runs) keeps the convenience path below.
    if config.auth.jwt_secret.is_none()
        && std::env::var("NEXUS_ENV").as_deref() == Ok("production")
    {
        bail_fatal(FatalError::MissingSecret("NEXUS_JWT_SECRET"));
    }

    // JWT secret — persist to /var/lib/nexus/jwt_secret so tokens survive restarts.
    let jwt_secret = config.auth.jwt_secret.clone().unwrap_or_else(|| {
        let secret_path = std::path::Path::new("/var/lib/nexus/jwt_secret");
        if let Ok(existing) = std::fs::read_to_string(secret_path) {
            let trimmed = existing.trim().to_string();
            if !trimmed.is_empty() {
                tracing::info!("Loaded JWT secret from {}", secret_path.display());
                return trimmed;
            }
        }
        let secret = auth::generate_secret();
        if let Err(e) = std::fs::create_dir_all("/var/lib/nexus") {
            tracing::warn!("Failed to create /var/lib/nexus: {e}");
        } else {
            use std::os::unix::fs::OpenOptionsExt;
            match std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(secret_path)
            {
                Ok(mut f) => {
                    use std::io::Write;
                    let _ = f.write_all(secret.as_bytes());
                    tracing::info!("Persisted JWT secret to {}", secret_path.display());
                }
                Err(e) => tracing::warn!("Failed to persist JWT secret: {e}"),
            }
        }
        secret
    });

    let worker_token = config.agent.worker_token.clone().unwrap_or_else(|| {
        if std::env::var("ALLOW_UNAUTHENTICATED_WORKERS").as_deref() == Ok("true") {
            tracing::warn!(
                "WORKER_TOKEN not set and ALLOW_UNAUTHENTICATED_WORKERS=true; \
                 accepting any agent credential"
            );
            String::new()
        } else {
            bail_fatal(FatalError::MissingSecret("WORKER_TOKEN"));
        }
    });

    let store = Arc::new(match Store::open(&config.server.db_path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to open persistent storage: {e}");
            std::process::exit(1);
        }
    });

    let credentials = Arc::new(CredentialStore::new(
        Arc::clone(&store),
        jwt_secret,
        config.auth.jwt_ttl_seconds,
        config.auth.pbkdf2_iterations,
        config.auth.setup_token.clone(),
    ));

    if credentials.needs_setup().await.unwrap_or(true)
        && let Ok(admin_password) = std::env::var("ADMIN_PASSWORD")
    {
        match credentials.setup(&admin_password).await {
            Ok(_) => tracing::info!("bootstrapped admin account from ADMIN_PASSWORD"),
            Err(e) => tracing::warn!("ADMIN_PASSWORD bootstrap failed: {e}"),
        }
    }

    let agents = Arc::new(AgentRegistry::new(config.agent.health_timeout_ms));
    let clients = ClientRegistry::new();
    let hub = Hub::new(
        Arc::clone(&store),
        Arc::clone(&agents),
        Arc::clone(&clients),
        HubConfig {
            output_tail_chars: config.session.output_tail_chars,
            output_flush_debounce: Duration::from_millis(config.session.output_flush_debounce_ms),
            resize_debounce: Duration::from_millis(config.session.resize_debounce_ms),
        },
    );

    let restored = hub.restore_from_store().await.unwrap_or(0);
    if restored > 0 {
        tracing::info!("restored {restored} session(s) from storage");
    }

    let state = Arc::new(AppState {
        credentials,
        agents,
        hub: Arc::clone(&hub),
        worker_token,
        web_root: config.server.web_root.clone(),
        metrics_require_auth: config.server.metrics_require_auth,
        login_limiter: LoginRateLimiter::new(5, 60),
        started_at: std::time::Instant::now(),
        metrics_logins_attempted: std::sync::atomic::AtomicU64::new(0),
        metrics_logins_failed: std::sync::atomic::AtomicU64::new(0),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  Nexus terminal relay hub");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => bail_fatal(FatalError::BindFailed(e)),
    };

    tracing::info!("Server ready, accepting connections");

    // Background task: liveness sweep + debounced output flush (spec §4.3, §4.7).
    let sweep_interval = Duration::from_millis(config.agent.sweep_interval_ms);
    let sweep_agents = Arc::clone(&agents);
    let sweep_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweep_agents.sweep_once().await;
            sweep_hub.flush_due().await;
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone().layer(axum::Extension(peer_addr));

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        Duration::from_secs(10),
                        acceptor.accept(stream),
                    ).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    tracing::info!("flushing session output before shutdown...");
    hub.flush_all().await;
    tracing::info!("nexus-hub shut down cleanly");

    Ok(())
}
