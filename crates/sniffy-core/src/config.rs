//! Runtime configuration.
//!
//! Reads the following environment variables (all optional):
//! - IO_SNIFFY_MONITOR_SOCKET (default: true)
//! - IO_SNIFFY_MONITOR_JDBC (default: true)
//! - IO_SNIFFY_CAPTURE_STACK_TRACES (default: false)
//! - IO_SNIFFY_CAPTURE_TRAFFIC (default: true)
//! - IO_SNIFFY_PACKET_MERGE_THRESHOLD, milliseconds (default: 500)
//! - IO_SNIFFY_TOP_SQL_CAPACITY (default: 1024)
//! - IO_SNIFFY_REGISTRY_PATH (default: none, policy is not persisted)

use crate::aggregator::DEFAULT_TOP_SQL_CAPACITY;
use crate::traffic::DEFAULT_MERGE_THRESHOLD_MS;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_MONITOR_SOCKET: &str = "IO_SNIFFY_MONITOR_SOCKET";
pub const ENV_MONITOR_JDBC: &str = "IO_SNIFFY_MONITOR_JDBC";
pub const ENV_CAPTURE_STACK_TRACES: &str = "IO_SNIFFY_CAPTURE_STACK_TRACES";
pub const ENV_CAPTURE_TRAFFIC: &str = "IO_SNIFFY_CAPTURE_TRAFFIC";
pub const ENV_PACKET_MERGE_THRESHOLD: &str = "IO_SNIFFY_PACKET_MERGE_THRESHOLD";
pub const ENV_TOP_SQL_CAPACITY: &str = "IO_SNIFFY_TOP_SQL_CAPACITY";
pub const ENV_REGISTRY_PATH: &str = "IO_SNIFFY_REGISTRY_PATH";

/// Error type for configuration parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Variable is set but its value cannot be parsed.
    InvalidValue { var: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { var, value } => {
                write!(f, "invalid value '{}' for {}", value, var)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffyConfig {
    /// Account network connections and bytes.
    pub monitor_socket: bool,
    /// Account SQL statements and data source calls.
    pub monitor_jdbc: bool,
    /// Attach a captured backtrace to every new identity and packet. On by
    /// default so failure reports show where each query came from.
    pub capture_stack_traces: bool,
    /// Keep packet payloads, not just byte counts.
    pub capture_traffic: bool,
    pub packet_merge_threshold: Duration,
    pub top_sql_capacity: usize,
    /// Policy file loaded at startup and rewritten on change.
    pub registry_path: Option<PathBuf>,
}

impl Default for SniffyConfig {
    fn default() -> Self {
        Self {
            monitor_socket: true,
            monitor_jdbc: true,
            capture_stack_traces: true,
            capture_traffic: true,
            packet_merge_threshold: Duration::from_millis(DEFAULT_MERGE_THRESHOLD_MS),
            top_sql_capacity: DEFAULT_TOP_SQL_CAPACITY,
            registry_path: None,
        }
    }
}

impl SniffyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from any variable source; unset variables
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_MONITOR_SOCKET) {
            config.monitor_socket = parse_bool(ENV_MONITOR_SOCKET, &v)?;
        }
        if let Some(v) = lookup(ENV_MONITOR_JDBC) {
            config.monitor_jdbc = parse_bool(ENV_MONITOR_JDBC, &v)?;
        }
        if let Some(v) = lookup(ENV_CAPTURE_STACK_TRACES) {
            config.capture_stack_traces = parse_bool(ENV_CAPTURE_STACK_TRACES, &v)?;
        }
        if let Some(v) = lookup(ENV_CAPTURE_TRAFFIC) {
            config.capture_traffic = parse_bool(ENV_CAPTURE_TRAFFIC, &v)?;
        }
        if let Some(v) = lookup(ENV_PACKET_MERGE_THRESHOLD) {
            let ms = parse_number(ENV_PACKET_MERGE_THRESHOLD, &v)?;
            config.packet_merge_threshold = Duration::from_millis(ms);
        }
        if let Some(v) = lookup(ENV_TOP_SQL_CAPACITY) {
            let capacity = parse_number(ENV_TOP_SQL_CAPACITY, &v)?;
            config.top_sql_capacity = usize::try_from(capacity).map_err(|_| invalid(ENV_TOP_SQL_CAPACITY, &v))?;
        }
        if let Some(v) = lookup(ENV_REGISTRY_PATH)
            && !v.trim().is_empty()
        {
            config.registry_path = Some(PathBuf::from(v.trim()));
        }

        Ok(config)
    }

    pub fn with_monitor_socket(mut self, enabled: bool) -> Self {
        self.monitor_socket = enabled;
        self
    }

    pub fn with_monitor_jdbc(mut self, enabled: bool) -> Self {
        self.monitor_jdbc = enabled;
        self
    }

    pub fn with_stack_traces(mut self, enabled: bool) -> Self {
        self.capture_stack_traces = enabled;
        self
    }

    pub fn with_traffic_capture(mut self, enabled: bool) -> Self {
        self.capture_traffic = enabled;
        self
    }

    pub fn with_packet_merge_threshold(mut self, threshold: Duration) -> Self {
        self.packet_merge_threshold = threshold;
        self
    }

    pub fn with_top_sql_capacity(mut self, capacity: usize) -> Self {
        self.top_sql_capacity = capacity;
        self
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }
}

fn invalid(var: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value)),
    }
}

fn parse_number(var: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| invalid(var, value))
}
