//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (COURIER_*, nested keys separated by `__`)
//!
//! Environment variables override the file.

use anyhow::{Context, Result};
use courier_bus::{BusConfig, RetryPolicy, RouterConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Files searched by [`Config::load`], first match wins.
const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "COURIER";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Service name, the base of every bus consumer group.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Identity of this process among the service's instances.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Bus configuration.
    #[serde(default)]
    pub bus: BusSection,

    /// Retry policy of bus handlers.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which backend carries bus messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process transport, for a single instance.
    #[default]
    Memory,
    /// Redis Streams.
    Redis,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Bus backend.
    #[serde(default)]
    pub kind: TransportKind,

    /// Redis URL, used when `kind` is `redis`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Messages retained per topic by the memory transport.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,

    /// Approximate entry cap per Redis stream.
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    /// Concurrent consumers per handler.
    #[serde(default = "default_workers_per_topic")]
    pub workers_per_topic: usize,

    /// Republish exhausted messages to a dead-letter topic.
    #[serde(default)]
    pub dead_letter: bool,

    /// Dead-letter topic prefix.
    #[serde(default = "default_dead_letter_prefix")]
    pub dead_letter_prefix: String,
}

/// Retry policy, durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait before the first retry.
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    /// Upper bound of a single wait.
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Growth factor between waits.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter spread, in `[0, 1]`.
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,

    /// Total retry budget per message. 0 means unlimited.
    #[serde(default = "default_max_elapsed_time")]
    pub max_elapsed_time_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound socket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per member.
    #[serde(default = "default_member_buffer")]
    pub member_buffer: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_service_name() -> String {
    "courier".to_string()
}

fn default_instance_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("courier-{}", std::process::id()))
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/api/v1/ws".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_retained() -> usize {
    courier_bus::memory::DEFAULT_MAX_RETAINED
}

fn default_stream_max_len() -> usize {
    100_000
}

fn default_workers_per_topic() -> usize {
    1
}

fn default_dead_letter_prefix() -> String {
    courier_bus::retry::DEFAULT_DEAD_LETTER_PREFIX.to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_interval() -> u64 {
    1_000
}

fn default_max_interval() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_randomization_factor() -> f64 {
    0.5
}

fn default_max_elapsed_time() -> u64 {
    15 * 60 * 1_000 // 15 minutes
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_member_buffer() -> usize {
    courier_core::DEFAULT_MEMBER_BUFFER
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            service_name: default_service_name(),
            instance_id: default_instance_id(),
            transport: TransportConfig::default(),
            bus: BusSection::default(),
            retry: RetryConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            kind: TransportKind::default(),
            redis_url: default_redis_url(),
            max_retained: default_max_retained(),
            stream_max_len: default_stream_max_len(),
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            workers_per_topic: default_workers_per_topic(),
            dead_letter: false,
            dead_letter_prefix: default_dead_letter_prefix(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
            max_elapsed_time_ms: default_max_elapsed_time(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            member_buffer: default_member_buffer(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl RetryConfig {
    /// The bus retry policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_elapsed_time: (self.max_elapsed_time_ms > 0)
                .then(|| Duration::from_millis(self.max_elapsed_time_ms)),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let found = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::layered(found.as_deref().map(Path::new), None)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Merge an optional TOML file with `COURIER_*` overrides.
    ///
    /// `env` replaces the process environment when given.
    fn layered(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(
                &path.to_string_lossy(),
                ::config::FileFormat::Toml,
            ));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let settings = builder.build().context("Failed to load configuration")?;
        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Bus settings derived from this configuration.
    #[must_use]
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            router: RouterConfig {
                service_name: self.service_name.clone(),
                instance_id: self.instance_id.clone(),
                workers_per_topic: self.bus.workers_per_topic,
                ..RouterConfig::default()
            },
            retry: self.retry.policy(),
            dead_letter: self.bus.dead_letter,
            dead_letter_prefix: self.bus.dead_letter_prefix.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.kind, TransportKind::Memory);
        assert_eq!(config.transport.websocket_path, "/api/v1/ws");
        assert!(!config.bus.dead_letter);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            service_name = "chat"

            [transport]
            kind = "redis"
            stream_max_len = 500

            [limits]
            member_buffer = 8
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.service_name, "chat");
        assert_eq!(config.transport.kind, TransportKind::Redis);
        assert_eq!(config.transport.stream_max_len, 500);
        assert_eq!(config.transport.max_retained, 10_000);
        assert_eq!(config.limits.member_buffer, 8);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_retry_policy_conversion() {
        let retry = RetryConfig {
            max_retries: 3,
            initial_interval_ms: 100,
            max_interval_ms: 1_000,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time_ms: 0,
        };
        let policy = retry.policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_interval, Duration::from_millis(100));
        assert_eq!(policy.max_elapsed_time, None);
        assert!(policy.validate().is_ok());

        assert_eq!(
            RetryConfig::default().policy().max_elapsed_time,
            Some(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_env_overrides_defaults() {
        let config = Config::layered(
            None,
            env(&[
                ("COURIER_PORT", "9100"),
                ("COURIER_TRANSPORT__KIND", "redis"),
                ("COURIER_BUS__DEAD_LETTER", "true"),
                ("UNRELATED", "x"),
            ]),
        )
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.transport.kind, TransportKind::Redis);
        assert!(config.bus.dead_letter);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_env_overrides_file() {
        let path = std::env::temp_dir().join(format!("courier-test-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "port = 7000\nservice_name = \"from-file\"").unwrap();
        drop(file);

        let config = Config::layered(Some(&path), env(&[("COURIER_PORT", "7001")])).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7001);
        assert_eq!(config.service_name, "from-file");
    }

    #[test]
    fn test_bus_config() {
        let config = Config {
            service_name: "svc".to_string(),
            instance_id: "pod-1".to_string(),
            ..Config::default()
        };
        let bus = config.bus_config();
        assert_eq!(bus.router.service_name, "svc");
        assert_eq!(bus.router.instance_id, "pod-1");
        assert_eq!(bus.router.workers_per_topic, 1);
        assert_eq!(bus.dead_letter_prefix, "dead-letter.");
    }
}
