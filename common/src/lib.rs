// Shared types, errors, and configuration for the skyrelay workspace

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BrokerConfig, BufferConfig, FanoutConfig, OverflowPolicy, ReconnectPolicy, RelayConfig,
};
pub use error::{RelayError, Result};
pub use types::{FieldValue, Point, QoS, TelemetryRecord};
