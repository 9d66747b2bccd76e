use std::path::Path;

use anyhow::{Context, Result};
use nexus_protocol::NexusConfig;

/// Load configuration: environment variables first (spec §6.4), with an
/// optional TOML file supplying defaults for anything the environment
/// leaves unset. Mirrors the donor's `load_config`, but env is now the
/// primary source and the TOML file the fallback, rather than the reverse.
pub fn load_config(path: &Path) -> Result<NexusConfig> {
    let mut config: NexusConfig = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;
        tracing::info!("loaded config from {}", path.display());
        config
    } else {
        tracing::info!(
            "no config file found at {}, using defaults overridden by environment",
            path.display()
        );
        NexusConfig::default()
    };

    apply_env(&mut config);
    Ok(config)
}

fn apply_env(config: &mut NexusConfig) {
    if let Ok(v) = std::env::var("PORT") {
        if let Ok(port) = v.parse() {
            config.server.port = port;
        }
    }
    if let Ok(v) = std::env::var("CLIENT_ORIGIN") {
        config.server.client_origin = v;
    }
    if let Ok(v) = std::env::var("NEXUS_JWT_SECRET") {
        config.auth.jwt_secret = Some(v);
    }
    if let Ok(v) = std::env::var("NEXUS_SETUP_TOKEN") {
        config.auth.setup_token = Some(v);
    }
    if let Ok(v) = std::env::var("WORKER_TOKEN") {
        config.agent.worker_token = Some(v);
    }
    if let Ok(v) = std::env::var("WORKER_HEALTH_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.agent.health_timeout_ms = ms;
        }
    }
    if let Ok(v) = std::env::var("WORKER_HEARTBEAT_MS") {
        if let Ok(ms) = v.parse() {
            // The agent-side heartbeat cadence is informational from the
            // hub's point of view; it only changes how often the sweep
            // needs to run to notice a missed beat promptly.
            config.agent.sweep_interval_ms = config.agent.sweep_interval_ms.min(ms);
        }
    }

    // ADMIN_PASSWORD, ALLOW_UNAUTHENTICATED_WORKERS, NEXUS_ENV,
    // AUTO_RESTART_SHELL, RUN_AS_USER and SHELL are read directly by
    // main.rs / the agent binary at the point they're used rather than
    // folded into NexusConfig, since they govern one-shot bootstrap
    // behaviour and agent-local PTY policy rather than hub-wide settings.
}
