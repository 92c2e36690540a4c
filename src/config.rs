use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::pool::SelectionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_body_size_limit")]
    pub body_size_limit: usize,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default = "default_stats_path")]
    pub stats_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_origin: default_cors_origin(),
            log_level: default_log_level(),
            body_size_limit: default_body_size_limit(),
            health_check_path: default_health_check_path(),
            stats_path: default_stats_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub selection_policy: SelectionPolicy,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_duration_ms")]
    pub cooldown_duration_ms: u64,
    #[serde(default = "default_probes_to_close")]
    pub probes_to_close: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            selection_policy: SelectionPolicy::default(),
            failure_threshold: default_failure_threshold(),
            cooldown_duration_ms: default_cooldown_duration_ms(),
            probes_to_close: default_probes_to_close(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_api_version")]
    pub api_version: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            api_version: default_upstream_api_version(),
            timeout_ms: default_upstream_timeout_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

fn default_port() -> u16 {
    8045
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_body_size_limit() -> usize {
    4 * 1024 * 1024
}
fn default_health_check_path() -> String {
    "/health".to_string()
}
fn default_stats_path() -> String {
    "/stats".to_string()
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_duration_ms() -> u64 {
    60_000
}
fn default_probes_to_close() -> u32 {
    3
}
fn default_upstream_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_upstream_api_version() -> String {
    "v1beta".to_string()
}
fn default_upstream_timeout_ms() -> u64 {
    30_000
}
fn default_retry_count() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    1_000
}

#[derive(Debug)]
pub struct ConfigFieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigFieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  • {}: {}", self.field, self.message)
    }
}

impl GatewayConfig {
    /// Build the effective configuration: defaults overlaid with environment
    /// overrides. Invalid values are logged and ignored, keeping the prior
    /// value.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = parse_env("PORT", |v| v.parse::<u16>().ok().filter(|p| *p > 0)) {
            info!("Using port from environment: {}", port);
            self.server.port = port;
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            if !origin.trim().is_empty() {
                self.server.cors_origin = origin.trim().to_string();
            }
        }
        if let Some(level) = parse_env("LOG_LEVEL", |v| {
            matches!(v, "debug" | "info" | "warn" | "error").then(|| v.to_string())
        }) {
            self.server.log_level = level;
        }
        if let Some(policy) = parse_env("SELECTION_POLICY", |v| v.parse::<SelectionPolicy>().ok()) {
            info!("Using selection policy from environment: {:?}", policy);
            self.scheduler.selection_policy = policy;
        }
        if let Some(threshold) = parse_env("FAILURE_THRESHOLD", |v| {
            v.parse::<u32>().ok().filter(|t| *t >= 1)
        }) {
            self.scheduler.failure_threshold = threshold;
        }
        if let Some(cooldown) = parse_env("COOLDOWN_DURATION_MS", |v| {
            v.parse::<u64>().ok().filter(|c| *c >= 1000)
        }) {
            self.scheduler.cooldown_duration_ms = cooldown;
        }
        if let Some(probes) = parse_env("PROBES_TO_CLOSE", |v| {
            v.parse::<u32>().ok().filter(|p| *p >= 1)
        }) {
            self.scheduler.probes_to_close = probes;
        }
        if let Ok(base_url) = std::env::var("UPSTREAM_BASE_URL") {
            let trimmed = base_url.trim().trim_end_matches('/');
            if !trimmed.is_empty() {
                self.upstream.base_url = trimmed.to_string();
            }
        }
        if let Ok(version) = std::env::var("UPSTREAM_API_VERSION") {
            if !version.trim().is_empty() {
                self.upstream.api_version = version.trim().to_string();
            }
        }
        if let Some(timeout) = parse_env("UPSTREAM_TIMEOUT_MS", |v| {
            v.parse::<u64>().ok().filter(|t| *t >= 1000)
        }) {
            self.upstream.timeout_ms = timeout;
        }
        if let Some(count) = parse_env("RETRY_COUNT", |v| v.parse::<u32>().ok()) {
            self.upstream.retry_count = count;
        }
        if let Some(delay) = parse_env("RETRY_DELAY_MS", |v| v.parse::<u64>().ok()) {
            self.upstream.retry_delay_ms = delay;
        }
        if let Some(limit) = parse_env("BODY_SIZE_LIMIT", |v| {
            v.parse::<usize>().ok().filter(|l| *l > 0)
        }) {
            self.server.body_size_limit = limit;
        }
        if let Some(path) = parse_env("HEALTH_CHECK_PATH", parse_route_path) {
            self.server.health_check_path = path;
        }
        if let Some(path) = parse_env("STATS_PATH", parse_route_path) {
            self.server.stats_path = path;
        }
    }

    pub fn validate(&self) -> Result<(), Vec<ConfigFieldError>> {
        let mut errors = Vec::new();
        if self.scheduler.failure_threshold < 1 {
            errors.push(ConfigFieldError {
                field: "failure_threshold",
                message: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.cooldown_duration_ms < 1000 {
            errors.push(ConfigFieldError {
                field: "cooldown_duration_ms",
                message: "must be at least 1000".to_string(),
            });
        }
        if self.scheduler.probes_to_close < 1 {
            errors.push(ConfigFieldError {
                field: "probes_to_close",
                message: "must be at least 1".to_string(),
            });
        }
        if self.upstream.timeout_ms < 1000 {
            errors.push(ConfigFieldError {
                field: "upstream_timeout_ms",
                message: "must be at least 1000".to_string(),
            });
        }
        if !self.upstream.base_url.starts_with("http") {
            errors.push(ConfigFieldError {
                field: "upstream_base_url",
                message: format!("not an http(s) url: {}", self.upstream.base_url),
            });
        }
        for (field, path) in [
            ("health_check_path", &self.server.health_check_path),
            ("stats_path", &self.server.stats_path),
        ] {
            if !path.starts_with('/') {
                errors.push(ConfigFieldError {
                    field,
                    message: format!("must start with '/': {}", path),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn parse_env<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match parse(trimmed) {
        Some(value) => Some(value),
        None => {
            warn!("Ignoring invalid {} value: {}", name, raw);
            None
        }
    }
}

fn parse_route_path(value: &str) -> Option<String> {
    value.starts_with('/').then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct ScopedEnvVar {
        name: &'static str,
        previous: Option<String>,
    }

    impl ScopedEnvVar {
        fn set(name: &'static str, value: &str) -> Self {
            let previous = std::env::var(name).ok();
            std::env::set_var(name, value);
            Self { name, previous }
        }
    }

    impl Drop for ScopedEnvVar {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => std::env::set_var(self.name, value),
                None => std::env::remove_var(self.name),
            }
        }
    }

    #[test]
    fn defaults_match_documented_knobs() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8045);
        assert_eq!(config.scheduler.failure_threshold, 3);
        assert_eq!(config.scheduler.cooldown_duration_ms, 60_000);
        assert_eq!(config.scheduler.probes_to_close, 3);
        assert_eq!(config.upstream.timeout_ms, 30_000);
        assert_eq!(config.upstream.retry_count, 2);
        assert_eq!(config.upstream.retry_delay_ms, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env lock");
        let _port = ScopedEnvVar::set("PORT", "9100");
        let _policy = ScopedEnvVar::set("SELECTION_POLICY", "least_in_flight");
        let _cooldown = ScopedEnvVar::set("COOLDOWN_DURATION_MS", "5000");

        let config = GatewayConfig::from_env();
        assert_eq!(config.server.port, 9100);
        assert_eq!(
            config.scheduler.selection_policy,
            SelectionPolicy::LeastInFlight
        );
        assert_eq!(config.scheduler.cooldown_duration_ms, 5000);
    }

    #[test]
    fn invalid_env_values_keep_prior_value() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env lock");
        let _port = ScopedEnvVar::set("PORT", "not-a-port");
        let _threshold = ScopedEnvVar::set("FAILURE_THRESHOLD", "0");
        let _cooldown = ScopedEnvVar::set("COOLDOWN_DURATION_MS", "50");

        let config = GatewayConfig::from_env();
        assert_eq!(config.server.port, 8045);
        assert_eq!(config.scheduler.failure_threshold, 3);
        assert_eq!(config.scheduler.cooldown_duration_ms, 60_000);
    }

    #[test]
    fn validation_reports_every_bad_field() {
        let mut config = GatewayConfig::default();
        config.scheduler.cooldown_duration_ms = 10;
        config.upstream.timeout_ms = 1;
        config.server.stats_path = "stats".to_string();

        let errors = config.validate().expect_err("validation should fail");
        let fields: Vec<&str> = errors.iter().map(|e| e.field).collect();
        assert!(fields.contains(&"cooldown_duration_ms"));
        assert!(fields.contains(&"upstream_timeout_ms"));
        assert!(fields.contains(&"stats_path"));
    }
}
