//! Configuration module for netmux
//!
//! JSON configuration for the multiplexer:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "concurrency": 8,
//!   "max_connections": 128,
//!   "idle_timeout_secs": 16,
//!   "first_payload_timeout_ms": 100,
//!   "pipe": { "size_limit": 65536, "unbounded": false }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{BufferPool, PipeLimit, PipeOptions};
use crate::error::{Error, Result};
use crate::mux::{ClientStrategy, WorkerOptions};

/// Concurrent sessions per connection when `concurrency` is 0
const DEFAULT_CONCURRENCY: u32 = 8;

/// Multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Concurrent sessions per physical connection.
    /// 0 selects the default (8), a negative value disables multiplexing.
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,

    /// Sessions a physical connection carries over its lifetime (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Idle interval before an empty client connection is closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long a new session waits for payload to piggyback on its New frame
    #[serde(default = "default_first_payload_timeout_ms")]
    pub first_payload_timeout_ms: u64,

    #[serde(default)]
    pub pipe: PipeConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_concurrency() -> i32 {
    DEFAULT_CONCURRENCY as i32
}

fn default_max_connections() -> u32 {
    128
}

fn default_idle_timeout_secs() -> u64 {
    16
}

fn default_first_payload_timeout_ms() -> u64 {
    100
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            concurrency: default_concurrency(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            first_payload_timeout_ms: default_first_payload_timeout_ms(),
            pipe: PipeConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            return Err(Error::Config("idle_timeout_secs must be positive".into()));
        }
        // Session ids are 16 bit; a larger lifetime cap would reuse live ids
        if self.max_connections > u32::from(u16::MAX) {
            return Err(Error::Config(format!(
                "max_connections too large: {}",
                self.max_connections
            )));
        }
        self.pipe.validate()
    }

    /// Multiplexing is on: enabled and concurrency not negative
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.concurrency >= 0
    }

    pub fn strategy(&self) -> ClientStrategy {
        let max_concurrency = match self.concurrency {
            c if c > 0 => c as u32,
            _ => DEFAULT_CONCURRENCY,
        };
        ClientStrategy {
            max_concurrency,
            max_connections: self.max_connections,
        }
    }

    pub fn pipe_options(&self) -> PipeOptions {
        self.pipe.to_options()
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            first_payload_timeout: Duration::from_millis(self.first_payload_timeout_ms),
            pipe: self.pipe_options(),
            pool: BufferPool::default(),
        }
    }
}

/// Pipe buffering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Soft bound on queued bytes per pipe
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,

    /// Disable backpressure entirely
    #[serde(default)]
    pub unbounded: bool,

    /// Drop writes that would block instead of waiting
    #[serde(default)]
    pub discard_overflow: bool,

    /// Fail writes blocked on backpressure after this long
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
}

fn default_size_limit() -> usize {
    crate::common::pipe::DEFAULT_PIPE_LIMIT
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            size_limit: default_size_limit(),
            unbounded: false,
            discard_overflow: false,
            write_timeout_ms: None,
        }
    }
}

impl PipeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.unbounded && self.size_limit == 0 {
            return Err(Error::Config(
                "pipe.size_limit must be positive unless pipe.unbounded is set".into(),
            ));
        }
        if self.write_timeout_ms == Some(0) {
            return Err(Error::Config("pipe.write_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn to_options(&self) -> PipeOptions {
        PipeOptions {
            limit: if self.unbounded {
                PipeLimit::Unbounded
            } else {
                PipeLimit::Bounded(self.size_limit)
            },
            discard_overflow: self.discard_overflow,
            write_timeout: self.write_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = MuxConfig::from_json("{}").unwrap();
        assert!(config.is_enabled());
        assert_eq!(config.strategy(), ClientStrategy::default());

        let options = config.worker_options();
        assert_eq!(options.idle_timeout, Duration::from_secs(16));
        assert_eq!(options.first_payload_timeout, Duration::from_millis(100));
        assert_eq!(options.pipe.limit, PipeLimit::Bounded(64 * 1024));
        assert!(options.pipe.write_timeout.is_none());
    }

    #[test]
    fn test_concurrency_values() {
        let zero = MuxConfig::from_json(r#"{"concurrency": 0}"#).unwrap();
        assert_eq!(zero.strategy().max_concurrency, 8);

        let custom = MuxConfig::from_json(r#"{"concurrency": 3, "max_connections": 0}"#).unwrap();
        assert_eq!(custom.strategy().max_concurrency, 3);
        assert_eq!(custom.strategy().max_connections, 0);

        let disabled = MuxConfig::from_json(r#"{"concurrency": -1}"#).unwrap();
        assert!(!disabled.is_enabled());
    }

    #[test]
    fn test_pipe_options() {
        let json = r#"{"pipe": {"unbounded": true, "discard_overflow": true, "write_timeout_ms": 250}}"#;
        let options = MuxConfig::from_json(json).unwrap().pipe_options();
        assert_eq!(options.limit, PipeLimit::Unbounded);
        assert!(options.discard_overflow);
        assert_eq!(options.write_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_validation() {
        assert!(MuxConfig::from_json(r#"{"idle_timeout_secs": 0}"#).is_err());
        assert!(MuxConfig::from_json(r#"{"max_connections": 70000}"#).is_err());
        assert!(MuxConfig::from_json(r#"{"pipe": {"size_limit": 0}}"#).is_err());
        assert!(MuxConfig::from_json(r#"{"pipe": {"size_limit": 0, "unbounded": true}}"#).is_ok());

        let err = MuxConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("netmux-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"concurrency": 4, "idle_timeout_secs": 30}"#).unwrap();

        let config = MuxConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.strategy().max_concurrency, 4);
        assert_eq!(config.worker_options().idle_timeout, Duration::from_secs(30));
        assert!(MuxConfig::load("/nonexistent/netmux.json").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = MuxConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = MuxConfig::from_json(&json).unwrap();
        assert_eq!(parsed.strategy(), config.strategy());
    }
}
