// Std types for the multicast group, config file path and timeouts
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

// Config files are plain JSON objects
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::{NodeError, Result};

//////////////////////
// LoggerConfig     //
//////////////////////

/// Where and how log lines are written
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    /// Colored output on stdout
    pub enable_console_log: bool,
    /// Also write `<log_file_path>/<name>.log`
    pub enable_file_log: bool,
    /// Directory for the log file (empty = current directory)
    pub log_file_path: String,
    /// File lines become JSON envelopes instead of plain text
    pub enable_json_log: bool,
    /// chrono format string for timestamps
    pub date_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            log_file_path: String::new(),
            enable_json_log: false,
            date_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        }
    }
}

//////////////////////
// DiscoveryConfig  //
//////////////////////

/// LAN multicast announce/listen settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Turn multicast discovery on or off
    pub enabled: bool,
    /// Multicast group every node joins
    pub group: Ipv4Addr,
    /// UDP port announcements are sent to and received on
    pub port: u16,
    /// Time between two announcements
    pub interval: Duration,
    /// Multicast TTL, 1 keeps datagrams on the local segment
    pub ttl: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: Ipv4Addr::new(230, 0, 0, 1),
            port: 4446,
            interval: Duration::from_secs(3),
            ttl: 1,
        }
    }
}

//////////////////////
// NodeConfig       //
//////////////////////

/// All the settings a node needs
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Display name sent in HELLO and discovery announcements
    pub name: String,

    /// IP to listen on (e.g. `"0.0.0.0"`)
    pub host: String,

    /// First port to try; 0 lets the OS pick
    pub port: u16,

    /// How many successive ports we try before giving up
    pub port_probe_count: u16,

    /// Upper bound for an outbound dial
    pub connect_timeout: Duration,

    /// How many message ids we remember for duplicate suppression
    pub dedup_capacity: usize,

    /// Lines buffered per connection before new ones are dropped
    pub outbound_queue_capacity: usize,

    /// Peers dialed per PEERSHARE received (0 disables auto-connect)
    pub max_peershare_dials: usize,

    /// Milliseconds to sleep after a failed accept
    pub accept_error_backoff_ms: u64,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    pub discovery: DiscoveryConfig,

    pub logger: LoggerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "peer".to_string(),
            host: "0.0.0.0".to_string(),
            port: 5000,
            port_probe_count: 50,
            connect_timeout: Duration::from_millis(4000),
            dedup_capacity: 5000,
            outbound_queue_capacity: 1024,
            max_peershare_dials: 3,
            accept_error_backoff_ms: 100,
            // This helper tells us how many CPU cores are available
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            discovery: DiscoveryConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let value: JsonValue = serde_json::from_str(&raw)?;
        Self::try_from(&value)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(NodeError::Config("name must not be empty".into()));
        }
        if self.port_probe_count == 0 {
            return Err(NodeError::Config("port_probe_count must be at least 1".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(NodeError::Config(
                "outbound_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/////////////////////////////////////////////
// Converting from a JSON object into Rust //
/////////////////////////////////////////////

// Helper: look up `key` in the object, or fall back to `default`.
// If the JSON value has the wrong type, we warn but still use `default`.
fn extract_or<T: DeserializeOwned>(obj: &JsonValue, key: &str, default: T) -> T {
    match obj.get(key) {
        // Key exists and is not null; try to convert it to Rust type T
        Some(value) if !value.is_null() => match serde_json::from_value::<T>(value.clone()) {
            Ok(val) => val,
            Err(err) => {
                log::warn!("Config: '{}' has wrong type: {}", key, err);
                default
            }
        },
        // Key missing or null: just use default
        _ => default,
    }
}

impl TryFrom<&JsonValue> for LoggerConfig {
    type Error = NodeError;

    fn try_from(obj: &JsonValue) -> Result<Self> {
        let d = LoggerConfig::default();
        Ok(LoggerConfig {
            log_level:          extract_or(obj, "log_level",          d.log_level),
            enable_console_log: extract_or(obj, "enable_console_log", d.enable_console_log),
            enable_file_log:    extract_or(obj, "enable_file_log",    d.enable_file_log),
            log_file_path:      extract_or(obj, "log_file_path",      d.log_file_path),
            enable_json_log:    extract_or(obj, "enable_json_log",    d.enable_json_log),
            date_format:        extract_or(obj, "date_format",        d.date_format),
        })
    }
}

impl TryFrom<&JsonValue> for DiscoveryConfig {
    type Error = NodeError;

    fn try_from(obj: &JsonValue) -> Result<Self> {
        let d = DiscoveryConfig::default();

        // The group is written as a dotted string; a bad one is a hard error
        // because every node on the LAN has to agree on it.
        let group = match obj.get("group").and_then(JsonValue::as_str) {
            Some(raw) => raw
                .parse::<Ipv4Addr>()
                .map_err(|e| NodeError::Config(format!("discovery.group '{}': {}", raw, e)))?,
            None => d.group,
        };
        if !group.is_multicast() {
            return Err(NodeError::Config(format!(
                "discovery.group {} is not a multicast address",
                group
            )));
        }

        Ok(DiscoveryConfig {
            enabled:  extract_or(obj, "enabled", d.enabled),
            group,
            port:     extract_or(obj, "port", d.port),
            interval: Duration::from_secs(extract_or(obj, "interval_secs", d.interval.as_secs()).max(1)),
            ttl:      extract_or(obj, "ttl", d.ttl),
        })
    }
}

impl TryFrom<&JsonValue> for NodeConfig {
    type Error = NodeError;

    fn try_from(obj: &JsonValue) -> Result<Self> {
        if !obj.is_object() {
            return Err(NodeError::Config("config root must be a JSON object".into()));
        }
        let d = NodeConfig::default();

        // Nested sections: use them when present, otherwise the defaults
        let discovery = match obj.get("discovery") {
            Some(section) if section.is_object() => DiscoveryConfig::try_from(section)?,
            _ => d.discovery,
        };
        let logger = match obj.get("logger") {
            Some(section) if section.is_object() => LoggerConfig::try_from(section)?,
            _ => d.logger,
        };

        let config = NodeConfig {
            name:                    extract_or(obj, "name",                    d.name),
            host:                    extract_or(obj, "host",                    d.host),
            port:                    extract_or(obj, "port",                    d.port),
            port_probe_count:        extract_or(obj, "port_probe_count",        d.port_probe_count),
            connect_timeout:         Duration::from_millis(extract_or(
                obj,
                "connect_timeout_ms",
                d.connect_timeout.as_millis() as u64,
            )),
            dedup_capacity:          extract_or(obj, "dedup_capacity",          d.dedup_capacity),
            outbound_queue_capacity: extract_or(obj, "outbound_queue_capacity", d.outbound_queue_capacity),
            max_peershare_dials:     extract_or(obj, "max_peershare_dials",     d.max_peershare_dials),
            accept_error_backoff_ms: extract_or(obj, "accept_error_backoff_ms", d.accept_error_backoff_ms),
            worker_threads:          extract_or(obj, "worker_threads",          d.worker_threads).max(1),
            discovery,
            logger,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_object_gives_defaults() {
        let config = NodeConfig::try_from(&json!({})).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.port_probe_count, 50);
        assert_eq!(config.dedup_capacity, 5000);
        assert_eq!(config.max_peershare_dials, 3);
        assert_eq!(config.connect_timeout, Duration::from_millis(4000));
        assert_eq!(config.discovery.group, Ipv4Addr::new(230, 0, 0, 1));
        assert_eq!(config.discovery.port, 4446);
        assert_eq!(config.discovery.interval, Duration::from_secs(3));
        assert!(config.worker_threads >= 1);
    }

    #[test]
    fn values_and_nested_sections_are_read() {
        let config = NodeConfig::try_from(&json!({
            "name": "alice",
            "port": 6000,
            "connect_timeout_ms": 250,
            "discovery": { "enabled": false, "interval_secs": 10 },
            "logger": { "log_level": "debug", "enable_file_log": true }
        }))
        .unwrap();

        assert_eq!(config.name, "alice");
        assert_eq!(config.port, 6000);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert!(!config.discovery.enabled);
        assert_eq!(config.discovery.interval, Duration::from_secs(10));
        assert_eq!(config.logger.log_level, "debug");
        assert!(config.logger.enable_file_log);
    }

    #[test]
    fn wrong_types_fall_back_to_defaults() {
        let config = NodeConfig::try_from(&json!({
            "port": "not a port",
            "dedup_capacity": -5,
            "name": null
        }))
        .unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.dedup_capacity, 5000);
        assert_eq!(config.name, "peer");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(NodeConfig::try_from(&json!({ "port_probe_count": 0 })).is_err());
        assert!(NodeConfig::try_from(&json!({ "name": "  " })).is_err());
        assert!(NodeConfig::try_from(&json!({ "discovery": { "group": "10.0.0.1" } })).is_err());
        assert!(NodeConfig::try_from(&json!([1, 2])).is_err());
    }

    #[test]
    fn reads_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "name": "carol", "max_peershare_dials": 0 }"#).unwrap();

        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "carol");
        assert_eq!(config.max_peershare_dials, 0);
    }
}
