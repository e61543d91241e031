//! Runtime knobs, read from the environment
//!
//! Every knob has a default matching the documented behavior; the
//! environment only overrides.

use std::time::Duration;

/// Supervision settings shared by all backends on this node.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of recent engine log lines retained for late subscribers.
    pub log_buffer_size: usize,
    /// Grace period between SIGTERM and SIGKILL when stopping an engine.
    pub stop_timeout: Duration,
    /// How long to wait for xray's readiness log line.
    pub startup_timeout: Duration,
    /// Tick interval of the debounced user-modification reload loop.
    pub user_mod_interval: Duration,
    /// Restart an engine that left the running state on its own.
    pub restart_on_failure: bool,
    /// Delay before a failure-triggered restart attempt.
    pub restart_on_failure_interval: Duration,
    /// Ceiling on consecutive failure-triggered restarts; 0 means unbounded.
    pub restart_on_failure_max_retries: u32,
    /// Host the engine's v2ray stats API listens on.
    pub api_host: String,
    /// Port the engine's v2ray stats API listens on.
    pub api_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_buffer_size: 100,
            stop_timeout: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(4),
            user_mod_interval: Duration::from_secs(10),
            restart_on_failure: false,
            restart_on_failure_interval: Duration::from_secs(5),
            restart_on_failure_max_retries: 0,
            api_host: "127.0.0.1".to_string(),
            api_port: 8081,
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_buffer_size: env_parse("LOG_BUFFER_SIZE", defaults.log_buffer_size),
            stop_timeout: env_secs("STOP_TIMEOUT", defaults.stop_timeout),
            startup_timeout: env_secs("STARTUP_TIMEOUT", defaults.startup_timeout),
            user_mod_interval: env_secs("USER_MOD_INTERVAL", defaults.user_mod_interval),
            restart_on_failure: env_parse("RESTART_ON_FAILURE", defaults.restart_on_failure),
            restart_on_failure_interval: env_secs(
                "RESTART_ON_FAILURE_INTERVAL",
                defaults.restart_on_failure_interval,
            ),
            restart_on_failure_max_retries: env_parse(
                "RESTART_ON_FAILURE_MAX_RETRIES",
                defaults.restart_on_failure_max_retries,
            ),
            api_host: std::env::var("STATS_API_HOST").unwrap_or(defaults.api_host),
            api_port: env_parse("STATS_API_PORT", defaults.api_port),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
