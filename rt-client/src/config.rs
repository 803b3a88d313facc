//! Connection options.
//!
//! Options are loaded from a TOML file; every field has a default, so an
//! empty file (or [`ConnectionOptions::default`]) gives a working setup
//! against the default endpoint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rtwire_core::{ErrorClassifier, StateTimeouts};
use serde::Deserialize;

/// Options for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionOptions {
    /// Where to connect.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Timers.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Outbound queue behavior.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Error classification thresholds.
    #[serde(default)]
    pub errors: ErrorClassifier,

    /// Recovery key from a previous connection.
    #[serde(default)]
    pub recover: Option<String>,
}

impl ConnectionOptions {
    /// Load options from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Set the primary host.
    pub fn with_host(mut self, host: &str) -> Self {
        self.endpoint.host = host.to_string();
        self
    }

    /// Replace the fallback hosts.
    pub fn with_fallback_hosts(mut self, hosts: &[&str]) -> Self {
        self.endpoint.fallback_hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    /// Recover a previous connection on the first connect.
    pub fn with_recover(mut self, recovery_key: &str) -> Self {
        self.recover = Some(recovery_key.to_string());
        self
    }

    /// Set the outbound queue capacity.
    pub fn with_max_queued_messages(mut self, max: usize) -> Self {
        self.queue.max_queued_messages = max;
        self
    }
}

/// Endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Primary host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Hosts tried, in random order, when the primary is unavailable.
    #[serde(default = "default_fallback_hosts")]
    pub fallback_hosts: Vec<String>,

    /// URL answering `yes` when the network is reachable.
    #[serde(default = "default_connectivity_check_url")]
    pub connectivity_check_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            fallback_hosts: default_fallback_hosts(),
            connectivity_check_url: default_connectivity_check_url(),
        }
    }
}

fn default_host() -> String {
    "realtime.rtwire.io".to_string()
}

fn default_fallback_hosts() -> Vec<String> {
    ["a", "b", "c", "d", "e"]
        .iter()
        .map(|n| format!("{n}.fallback.rtwire.io"))
        .collect()
}

fn default_connectivity_check_url() -> String {
    "https://internet-up.rtwire.io/is-the-internet-up.txt".to_string()
}

/// Timer configuration, all in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Time allowed for a connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay before retrying from `disconnected`.
    #[serde(default = "default_disconnected_retry_timeout_ms")]
    pub disconnected_retry_timeout_ms: u64,

    /// Delay before retrying from `suspended`.
    #[serde(default = "default_suspended_retry_timeout_ms")]
    pub suspended_retry_timeout_ms: u64,

    /// Time allowed for close confirmation, heartbeat replies and idle slack.
    #[serde(default = "default_realtime_request_timeout_ms")]
    pub realtime_request_timeout_ms: u64,

    /// How long connection state survives on the server when it does not
    /// tell us.
    #[serde(default = "default_connection_state_ttl_ms")]
    pub connection_state_ttl_ms: u64,
}

impl TimeoutConfig {
    /// Realtime request timeout as a [`Duration`].
    pub fn realtime_request(&self) -> Duration {
        Duration::from_millis(self.realtime_request_timeout_ms)
    }

    /// Connection state TTL as a [`Duration`].
    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }

    /// Timers for the state table.
    pub fn state_timeouts(&self) -> StateTimeouts {
        StateTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            disconnected_retry: Duration::from_millis(self.disconnected_retry_timeout_ms),
            suspended_retry: Duration::from_millis(self.suspended_retry_timeout_ms),
            close: self.realtime_request(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnected_retry_timeout_ms: default_disconnected_retry_timeout_ms(),
            suspended_retry_timeout_ms: default_suspended_retry_timeout_ms(),
            realtime_request_timeout_ms: default_realtime_request_timeout_ms(),
            connection_state_ttl_ms: default_connection_state_ttl_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_disconnected_retry_timeout_ms() -> u64 {
    15_000
}

fn default_suspended_retry_timeout_ms() -> u64 {
    30_000
}

fn default_realtime_request_timeout_ms() -> u64 {
    10_000
}

fn default_connection_state_ttl_ms() -> u64 {
    120_000
}

/// Outbound queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Buffer messages while not connected.
    #[serde(default = "default_queue_messages")]
    pub queue_messages: bool,

    /// Queued messages beyond this are refused.
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_messages: default_queue_messages(),
            max_queued_messages: default_max_queued_messages(),
        }
    }
}

fn default_queue_messages() -> bool {
    true
}

fn default_max_queued_messages() -> usize {
    10_000
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to config file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse config file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to config file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtwire_types::ErrorInfo;

    #[test]
    fn default_options_are_usable() {
        let options = ConnectionOptions::default();
        assert_eq!(options.endpoint.host, "realtime.rtwire.io");
        assert_eq!(options.endpoint.fallback_hosts.len(), 5);
        assert!(options.queue.queue_messages);
        assert!(options.recover.is_none());
    }

    #[test]
    fn default_timeouts_match_state_table_defaults() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.state_timeouts(), StateTimeouts::default());
        assert_eq!(timeouts.connection_state_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn options_from_toml_string() {
        let toml = r#"
recover = "abc"

[endpoint]
host = "primary.example"
fallback_hosts = ["f1.example", "f2.example"]

[timeouts]
connect_timeout_ms = 500
suspended_retry_timeout_ms = 60000

[queue]
queue_messages = false
max_queued_messages = 3

[errors]
fatal_status_below = 400
"#;

        let options: ConnectionOptions = toml::from_str(toml).unwrap();
        assert_eq!(options.endpoint.host, "primary.example");
        assert_eq!(options.endpoint.fallback_hosts, vec!["f1.example", "f2.example"]);
        assert_eq!(
            options.timeouts.state_timeouts().connect,
            Duration::from_millis(500)
        );
        assert_eq!(options.timeouts.suspended_retry_timeout_ms, 60_000);
        assert_eq!(options.timeouts.disconnected_retry_timeout_ms, 15_000);
        assert!(!options.queue.queue_messages);
        assert_eq!(options.queue.max_queued_messages, 3);
        assert_eq!(options.recover.as_deref(), Some("abc"));

        // 450 is below the default threshold but not the configured one.
        let err = ErrorInfo::new("upstream", 60000, 450);
        assert!(!options.errors.is_fatal(Some(&err)));
    }

    #[test]
    fn missing_sections_use_defaults() {
        let options: ConnectionOptions = toml::from_str("").unwrap();
        assert_eq!(options.timeouts.realtime_request(), Duration::from_secs(10));
        assert_eq!(options.queue.max_queued_messages, 10_000);
    }

    #[test]
    fn builder_overrides() {
        let options = ConnectionOptions::default()
            .with_host("h")
            .with_fallback_hosts(&["x"])
            .with_recover("key")
            .with_max_queued_messages(1);

        assert_eq!(options.endpoint.host, "h");
        assert_eq!(options.endpoint.fallback_hosts, vec!["x"]);
        assert_eq!(options.recover.as_deref(), Some("key"));
        assert_eq!(options.queue.max_queued_messages, 1);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = ConnectionOptions::from_file(Path::new("/nonexistent/rtwire.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
