use serde::{Deserialize, Serialize};

/// Hub-wide configuration. Read from environment variables first, with an
/// optional TOML file providing defaults for anything the environment does
/// not set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexusConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agent: AgentRegistryConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent).
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent).
    pub tls_key: Option<String>,
    /// Path to the web client's static files.
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// CORS origin allowed to open client WebSocket connections. "*" allows any.
    #[serde(default = "default_client_origin")]
    pub client_origin: String,
    /// Require JWT auth for the /metrics endpoint.
    #[serde(default = "default_true")]
    pub metrics_require_auth: bool,
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT signing secret. Auto-generated and persisted on first run if absent.
    pub jwt_secret: Option<String>,
    /// Token lifetime in seconds.
    #[serde(default = "default_jwt_ttl_seconds")]
    pub jwt_ttl_seconds: u64,
    /// One-time token gating the bootstrap `/api/auth/setup` call. If unset,
    /// setup is only reachable from a loopback address.
    pub setup_token: Option<String>,
    /// PBKDF2 iteration count for password hashing.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistryConfig {
    /// Shared credential agents present when connecting.
    pub worker_token: Option<String>,
    /// Milliseconds since the last heartbeat after which an agent is
    /// considered offline.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// How often the liveness sweep runs, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum characters retained in a session's replay tail.
    #[serde(default = "default_output_tail_chars")]
    pub output_tail_chars: usize,
    /// Quiet period, in milliseconds, before a coalesced output-tail write
    /// is flushed to storage.
    #[serde(default = "default_output_flush_debounce_ms")]
    pub output_flush_debounce_ms: u64,
    /// Debounce window, in milliseconds, for viewport-driven PTY resizes.
    #[serde(default = "default_resize_debounce_ms")]
    pub resize_debounce_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            web_root: default_web_root(),
            client_origin: default_client_origin(),
            metrics_require_auth: default_true(),
            db_path: default_db_path(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_ttl_seconds: default_jwt_ttl_seconds(),
            setup_token: None,
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

impl Default for AgentRegistryConfig {
    fn default() -> Self {
        Self {
            worker_token: None,
            health_timeout_ms: default_health_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_tail_chars: default_output_tail_chars(),
            output_flush_debounce_ms: default_output_flush_debounce_ms(),
            resize_debounce_ms: default_resize_debounce_ms(),
        }
    }
}

fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3002 }
fn default_web_root() -> String { "./web".to_string() }
fn default_client_origin() -> String { "*".to_string() }
fn default_db_path() -> String { "./nexus.db".to_string() }
fn default_true() -> bool { true }
fn default_jwt_ttl_seconds() -> u64 { 12 * 60 * 60 }
fn default_pbkdf2_iterations() -> u32 { 150_000 }
fn default_health_timeout_ms() -> u64 { 15_000 }
fn default_sweep_interval_ms() -> u64 { 5_000 }
fn default_output_tail_chars() -> usize { 50_000 }
fn default_output_flush_debounce_ms() -> u64 { 2_000 }
fn default_resize_debounce_ms() -> u64 { 100 }

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            agent: AgentRegistryConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl NexusConfig {
    /// Collects configuration problems rather than failing on the first one,
    /// so a misconfigured deployment sees the whole list in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must not be 0".to_string());
        }
        if self.server.client_origin.trim().is_empty() {
            issues.push("ERROR: server.client_origin must not be empty".to_string());
        }
        if self.auth.jwt_ttl_seconds == 0 {
            issues.push("ERROR: auth.jwt_ttl_seconds must not be 0".to_string());
        }
        if self.auth.pbkdf2_iterations < 100_000 {
            issues.push(format!(
                "WARNING: auth.pbkdf2_iterations ({}) is below the recommended minimum of 100000",
                self.auth.pbkdf2_iterations
            ));
        }
        if self.agent.health_timeout_ms == 0 {
            issues.push("ERROR: agent.health_timeout_ms must not be 0".to_string());
        }
        if self.agent.sweep_interval_ms == 0 {
            issues.push("ERROR: agent.sweep_interval_ms must not be 0".to_string());
        }
        if self.agent.sweep_interval_ms > self.agent.health_timeout_ms {
            issues.push(
                "WARNING: agent.sweep_interval_ms is larger than agent.health_timeout_ms; dead agents will linger"
                    .to_string(),
            );
        }
        if self.session.output_tail_chars == 0 {
            issues.push("ERROR: session.output_tail_chars must not be 0".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config: NexusConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3002);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.client_origin, "*");
        assert_eq!(config.auth.jwt_ttl_seconds, 12 * 60 * 60);
        assert_eq!(config.auth.pbkdf2_iterations, 150_000);
        assert_eq!(config.agent.health_timeout_ms, 15_000);
        assert_eq!(config.agent.sweep_interval_ms, 5_000);
        assert_eq!(config.session.output_tail_chars, 50_000);
        assert_eq!(config.session.output_flush_debounce_ms, 2_000);
        assert_eq!(config.session.resize_debounce_ms, 100);
    }

    #[test]
    fn partial_toml_overrides_only_given_fields() {
        let toml_str = r#"
            [server]
            port = 8080
        "#;
        let config: NexusConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
    }

    #[test]
    fn default_trait_matches_empty_toml_parse() {
        let from_default = NexusConfig::default();
        let from_toml: NexusConfig = toml::from_str("").unwrap();
        assert_eq!(from_default.server.port, from_toml.server.port);
        assert_eq!(from_default.auth.jwt_ttl_seconds, from_toml.auth.jwt_ttl_seconds);
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = NexusConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = NexusConfig::default();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("port")));
    }

    #[test]
    fn validate_warns_on_weak_pbkdf2_iterations() {
        let mut config = NexusConfig::default();
        config.auth.pbkdf2_iterations = 1_000;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING") && i.contains("pbkdf2")));
    }

    #[test]
    fn validate_warns_when_sweep_slower_than_timeout() {
        let mut config = NexusConfig::default();
        config.agent.sweep_interval_ms = 20_000;
        config.agent.health_timeout_ms = 15_000;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("sweep_interval_ms")));
    }

    #[test]
    fn validate_rejects_empty_client_origin() {
        let mut config = NexusConfig::default();
        config.server.client_origin = "".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("client_origin")));
    }
}
