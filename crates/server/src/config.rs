//! Coordinator configuration
//!
//! Every timing constant the lifecycle controller consumes lives here so
//! the pure decision functions can be tested against explicit values.
//! Environment overrides use the `SLIPWAY_` prefix.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Spawn circuit breaker
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive permanent failures before the breaker opens
    pub threshold: u32,
    /// Failure window; at exactly this age the counter resets
    pub window_ms: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_ms: 5 * 60 * 1000,
        }
    }
}

/// Spawn pacing
#[derive(Debug, Clone, Copy)]
pub struct SpawnConfig {
    /// Minimum gap between spawn attempts for a non-terminal sandbox
    pub cooldown_ms: i64,
    /// How long a `ready` record without a live socket is trusted before
    /// a respawn is allowed
    pub ready_wait_ms: i64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 30 * 1000,
            ready_wait_ms: 60 * 1000,
        }
    }
}

/// Idle shutdown
#[derive(Debug, Clone, Copy)]
pub struct InactivityConfig {
    pub timeout_ms: i64,
    /// Grace period granted while clients are still connected
    pub extension_ms: i64,
    pub min_check_ms: i64,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10 * 60 * 1000,
            extension_ms: 5 * 60 * 1000,
            min_check_ms: 30 * 1000,
        }
    }
}

/// Sandbox heartbeat liveness
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval_ms: i64,
    /// 3x the send interval; beyond this the sandbox is stale
    pub stale_after_ms: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30 * 1000,
            stale_after_ms: 90 * 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Externally reachable URL sandboxes connect back to
    pub control_plane_url: String,
    pub default_model: String,
    /// Provider string forwarded to the sandbox manager
    pub provider_name: String,

    pub modal_base_url: String,
    pub modal_api_token: String,

    pub github_api_base: String,
    pub github_app_id: Option<String>,
    pub github_app_private_key: Option<String>,
    pub github_app_installation_id: Option<u64>,

    pub callback_url: Option<String>,
    pub callback_secret: Option<String>,

    pub breaker: BreakerConfig,
    pub spawn: SpawnConfig,
    pub inactivity: InactivityConfig,
    pub heartbeat: HeartbeatConfig,

    /// End-to-end budget for the push round-trip during PR creation
    pub push_timeout_ms: u64,
    /// Client sockets must subscribe within this window
    pub auth_deadline_ms: u64,
    /// Allowed clock skew when checking host token expiry
    pub token_expiry_skew_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4100)),
            data_dir: PathBuf::from(".slipway"),
            control_plane_url: "http://127.0.0.1:4100".to_string(),
            default_model: "claude-sonnet-4-5".to_string(),
            provider_name: "anthropic".to_string(),
            modal_base_url: "http://127.0.0.1:4200".to_string(),
            modal_api_token: String::new(),
            github_api_base: "https://api.github.com".to_string(),
            github_app_id: None,
            github_app_private_key: None,
            github_app_installation_id: None,
            callback_url: None,
            callback_secret: None,
            breaker: BreakerConfig::default(),
            spawn: SpawnConfig::default(),
            inactivity: InactivityConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            push_timeout_ms: 180 * 1000,
            auth_deadline_ms: 30 * 1000,
            token_expiry_skew_ms: 60 * 1000,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Resolve configuration from the environment, falling back to the
    /// documented defaults.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(addr) = env_var("SLIPWAY_BIND_ADDR").and_then(|v| v.parse().ok()) {
            cfg.bind_addr = addr;
        }
        if let Some(dir) = env_var("SLIPWAY_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_var("SLIPWAY_CONTROL_PLANE_URL") {
            cfg.control_plane_url = url;
        }
        if let Some(model) = env_var("SLIPWAY_DEFAULT_MODEL") {
            cfg.default_model = model;
        }
        if let Some(provider) = env_var("SLIPWAY_PROVIDER") {
            cfg.provider_name = provider;
        }
        if let Some(url) = env_var("SLIPWAY_MODAL_URL") {
            cfg.modal_base_url = url;
        }
        if let Some(token) = env_var("SLIPWAY_MODAL_TOKEN") {
            cfg.modal_api_token = token;
        }
        if let Some(base) = env_var("SLIPWAY_GITHUB_API_BASE") {
            cfg.github_api_base = base;
        }
        cfg.github_app_id = env_var("SLIPWAY_GITHUB_APP_ID");
        cfg.github_app_private_key = env_var("SLIPWAY_GITHUB_APP_PRIVATE_KEY");
        cfg.github_app_installation_id =
            env_var("SLIPWAY_GITHUB_APP_INSTALLATION_ID").and_then(|v| v.parse().ok());
        cfg.callback_url = env_var("SLIPWAY_CALLBACK_URL");
        cfg.callback_secret = env_var("INTERNAL_CALLBACK_SECRET");

        cfg
    }

    /// Deterministic head branch for PRs opened from a session.
    pub fn head_branch_for(session_name: &str) -> String {
        format!("slipway/{session_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.breaker.threshold, 3);
        assert_eq!(cfg.breaker.window_ms, 300_000);
        assert_eq!(cfg.spawn.cooldown_ms, 30_000);
        assert_eq!(cfg.spawn.ready_wait_ms, 60_000);
        assert_eq!(cfg.inactivity.timeout_ms, 600_000);
        assert_eq!(cfg.inactivity.extension_ms, 300_000);
        assert_eq!(cfg.inactivity.min_check_ms, 30_000);
        assert_eq!(cfg.heartbeat.stale_after_ms, 90_000);
        assert_eq!(cfg.push_timeout_ms, 180_000);
        assert_eq!(cfg.auth_deadline_ms, 30_000);
    }

    #[test]
    fn head_branch_is_deterministic() {
        assert_eq!(Config::head_branch_for("s1"), "slipway/s1");
        assert_eq!(Config::head_branch_for("s1"), Config::head_branch_for("s1"));
    }
}
