// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Kind of traffic a service carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Request/response over client sessions.
    #[default]
    Session,
    /// Mask-based publish/subscribe.
    Publish,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Session => "session",
            ServiceKind::Publish => "publish",
        }
    }

    /// Parse the `serviceType` attribute value (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("session") {
            Some(ServiceKind::Session)
        } else if value.eq_ignore_ascii_case("publish") {
            Some(ServiceKind::Publish)
        } else {
            None
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker name (for identification in logs and INSPECT reports).
    #[serde(default = "default_name")]
    pub name: String,

    /// Address to bind the client/backend listener to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted message (header block + body), also the cap for
    /// reassembled part runs.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Body bytes per frame before a message is split into parts.
    #[serde(default = "default_large_message_limit")]
    pub large_message_limit: usize,

    /// Create unknown services on REGISTER_SERVICE.
    #[serde(default = "default_true")]
    pub dynamic_services: bool,

    /// Session echo interval used when neither the request nor the service
    /// sets one (seconds).
    #[serde(default = "default_echo_interval")]
    pub echo_interval_secs: u64,

    /// A session expires after `echo interval * echo_grace_factor` without
    /// client activity.
    #[serde(default = "default_echo_grace_factor")]
    pub echo_grace_factor: u32,

    /// Period of the session reaper (milliseconds).
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_ms: u64,

    /// How long ids of aborted sessions keep answering CONNECTION_LOST
    /// (seconds).
    #[serde(default = "default_tombstone_retention")]
    pub tombstone_retention_secs: u64,

    /// Capacity of each client connection's outbound queue.
    #[serde(default = "default_push_capacity")]
    pub push_channel_capacity: usize,

    /// Capacity of the broker event channel.
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Connection pool defaults for every registered server.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Statically declared services.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_name() -> String {
    "sc-broker".to_string()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9000
}

fn default_max_message_size() -> usize {
    scmp::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_large_message_limit() -> usize {
    scmp::DEFAULT_LARGE_MESSAGE_LIMIT
}

fn default_true() -> bool {
    true
}

fn default_echo_interval() -> u64 {
    60
}

fn default_echo_grace_factor() -> u32 {
    2
}

fn default_reaper_interval() -> u64 {
    1000
}

fn default_tombstone_retention() -> u64 {
    300
}

fn default_push_capacity() -> usize {
    256
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind_address: default_bind_address(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            large_message_limit: default_large_message_limit(),
            dynamic_services: true,
            echo_interval_secs: default_echo_interval(),
            echo_grace_factor: default_echo_grace_factor(),
            reaper_interval_ms: default_reaper_interval(),
            tombstone_retention_secs: default_tombstone_retention(),
            push_channel_capacity: default_push_capacity(),
            event_channel_capacity: default_event_capacity(),
            log_level: default_log_level(),
            pool: PoolConfig::default(),
            services: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size cannot be 0".into()));
        }
        if self.large_message_limit == 0 {
            return Err(ConfigError::Invalid(
                "large_message_limit cannot be 0".into(),
            ));
        }
        if self.echo_grace_factor == 0 {
            return Err(ConfigError::Invalid("echo_grace_factor cannot be 0".into()));
        }
        if self.reaper_interval_ms == 0 {
            return Err(ConfigError::Invalid("reaper_interval_ms cannot be 0".into()));
        }
        if self.push_channel_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel capacities must be at least 1".into(),
            ));
        }
        self.pool.validate()?;

        for (i, service) in self.services.iter().enumerate() {
            if service.name.is_empty() {
                return Err(ConfigError::Invalid(format!("Service {} has empty name", i)));
            }
            if service.name.contains(|c: char| c == '\n' || c == '=') {
                return Err(ConfigError::Invalid(format!(
                    "Service {:?} name contains '=' or a line break",
                    service.name
                )));
            }
            if self.services[..i].iter().any(|s| s.name == service.name) {
                return Err(ConfigError::Invalid(format!(
                    "Service {:?} declared twice",
                    service.name
                )));
            }
            if service.mask_length == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "Service {:?} has mask_length 0",
                    service.name
                )));
            }
            if service.echo_interval_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "Service {:?} has echo_interval_ms 0",
                    service.name
                )));
            }
        }

        Ok(())
    }

    /// Add a service declaration.
    pub fn add_service(&mut self, service: ServiceConfig) {
        self.services.push(service);
    }

    /// Listener address as `ip:port`.
    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn echo_interval(&self) -> Duration {
        Duration::from_secs(self.echo_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }
}

/// Connection pool settings (per backend server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on open connections per server. REGISTER_SERVICE may
    /// override it with `maxConnections`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long a borrow waits for a free connection slot.
    #[serde(default = "default_borrow_timeout")]
    pub borrow_timeout_ms: u64,

    /// Send + receive budget for one backend exchange.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Idle connections older than this are closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Keep-alive probe period for idle connections (0 disables probing).
    /// REGISTER_SERVICE may override it with `keepAliveInterval` (seconds).
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_ms: u64,

    /// How long to wait for the answer to a keep-alive probe.
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout_ms: u64,

    /// Period of the pool maintenance pass.
    #[serde(default = "default_maintenance_tick")]
    pub maintenance_tick_ms: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_borrow_timeout() -> u64 {
    5_000
}

fn default_operation_timeout() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    60_000
}

fn default_keep_alive_interval() -> u64 {
    30_000
}

fn default_keep_alive_timeout() -> u64 {
    5_000
}

fn default_maintenance_tick() -> u64 {
    1_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout(),
            borrow_timeout_ms: default_borrow_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            keep_alive_interval_ms: default_keep_alive_interval(),
            keep_alive_timeout_ms: default_keep_alive_timeout(),
            maintenance_tick_ms: default_maintenance_tick(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("pool.max_connections cannot be 0".into()));
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("borrow_timeout_ms", self.borrow_timeout_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("keep_alive_timeout_ms", self.keep_alive_timeout_ms),
            ("maintenance_tick_ms", self.maintenance_tick_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("pool.{} cannot be 0", name)));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// `None` when probing is disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn maintenance_tick(&self) -> Duration {
        Duration::from_millis(self.maintenance_tick_ms)
    }
}

/// A statically declared service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default)]
    pub kind: ServiceKind,

    /// Services start enabled unless told otherwise.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fixed subscription mask length (publish services).
    #[serde(default)]
    pub mask_length: Option<usize>,

    /// Mask wildcard character.
    #[serde(default = "default_wildcard")]
    pub wildcard: char,

    /// Session echo interval override (milliseconds).
    #[serde(default)]
    pub echo_interval_ms: Option<u64>,
}

fn default_wildcard() -> char {
    '%'
}

impl ServiceConfig {
    /// Enabled session service with defaults.
    pub fn session(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServiceKind::Session,
            enabled: true,
            mask_length: None,
            wildcard: default_wildcard(),
            echo_interval_ms: None,
        }
    }

    /// Enabled publish service with a fixed mask length.
    pub fn publish(name: impl Into<String>, mask_length: usize) -> Self {
        Self {
            kind: ServiceKind::Publish,
            mask_length: Some(mask_length),
            ..Self::session(name)
        }
    }

    pub fn with_wildcard(mut self, wildcard: char) -> Self {
        self.wildcard = wildcard;
        self
    }

    pub fn with_echo_interval(mut self, interval: Duration) -> Self {
        self.echo_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn echo_interval(&self) -> Option<Duration> {
        self.echo_interval_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 9000);
        assert!(config.dynamic_services);
        assert_eq!(config.pool.max_connections, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            name = "edge"
            port = 9100
            dynamic_services = false

            [pool]
            max_connections = 4
            keep_alive_interval_ms = 0

            [[services]]
            name = "billing"

            [[services]]
            name = "quotes"
            kind = "publish"
            mask_length = 10
            wildcard = "-"
        "#;

        let config: BrokerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.name, "edge");
        assert!(!config.dynamic_services);
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.keep_alive_interval(), None);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].kind, ServiceKind::Session);
        assert!(config.services[0].enabled);
        assert_eq!(config.services[1].kind, ServiceKind::Publish);
        assert_eq!(config.services[1].wildcard, '-');
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9200\n[[services]]\nname = \"echo\"").unwrap();

        let config = BrokerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.services[0].name, "echo");
    }

    #[test]
    fn test_validation_rejects_duplicates_and_zeroes() {
        let mut config = BrokerConfig::default();
        config.add_service(ServiceConfig::session("a"));
        config.add_service(ServiceConfig::session("a"));
        assert!(config.validate().is_err());

        let config = BrokerConfig {
            pool: PoolConfig {
                max_connections: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.add_service(ServiceConfig::publish("p", 0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_kind_parse() {
        assert_eq!(ServiceKind::parse("PUBLISH"), Some(ServiceKind::Publish));
        assert_eq!(ServiceKind::parse("session"), Some(ServiceKind::Session));
        assert_eq!(ServiceKind::parse("file"), None);
    }
}
