//! Relay configuration: broker endpoint, reconnect policy, fan-out queue
//! bounds, and buffered-sink thresholds. Loaded from TOML or built from the
//! defaults constructors.

use crate::error::RelayError;
use crate::types::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration consumed by a relay host.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub fanout: FanoutConfig,
    pub buffer: BufferConfig,
    /// Topic patterns subscribed at startup.
    pub subscriptions: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            fanout: FanoutConfig::default(),
            buffer: BufferConfig::default(),
            subscriptions: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Broker endpoint and session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// QoS used for broker-level subscriptions.
    pub qos: QoS,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "skyrelay".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            qos: QoS::AtMostOnce,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Exponential backoff schedule for connect and reconnect attempts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub first_delay_ms: u64,
    pub rate: f64,
    pub max_delay_ms: u64,
    /// Retries after which the next failure is fatal.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            first_delay_ms: 1_000,
            rate: 2.0,
            max_delay_ms: 60_000,
            max_attempts: 12,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `retry` (zero-based): first_delay * rate^retry,
    /// capped at max_delay.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.first_delay_ms as f64 * self.rate.powi(retry as i32);
        let capped = scaled.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// What to do when a consumer queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the dispatcher until the worker frees a slot.
    Block,
    /// Evict the oldest queued record to make room; the drop is counted.
    DropOldest,
    /// Reject the incoming record; the drop is counted.
    DropNewest,
}

/// Fan-out dispatcher and consumer-worker tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Queue wait per iteration so workers can notice shutdown with no traffic.
    pub pop_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Per-worker join budget during terminate before the task is aborted.
    pub shutdown_grace_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            overflow: OverflowPolicy::DropOldest,
            pop_timeout_ms: 3_000,
            poll_interval_ms: 3_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl FanoutConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Buffered time-series sink thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    pub flush_size: usize,
    pub flush_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_size: 100,
            flush_interval_ms: 1_000,
            channel_capacity: 1_024,
        }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
