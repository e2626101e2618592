//! Telemetry relay core
//!
//! Connection-lifecycle management for a message broker, wildcard
//! subscription routing, and multi-consumer fan-out with independent pacing
//! and graceful shutdown. The upstream poller, the concrete storage clients,
//! and the host's CLI/config glue live outside this crate; they plug in
//! through the `TelemetrySource`, `RecordSink`, and `PointWriter` traits.

pub mod broker;
pub mod codec;
pub mod fanout;
pub mod sink;
pub mod topics;
pub mod transport;

pub use broker::{BrokerConnection, BrokerHandle, ConnectionState, ConnectionStats};
pub use codec::{EnvelopeHeader, TelemetryEnvelope};
pub use fanout::{ConsumerStats, FanoutDispatcher, Frame, TelemetrySource};
pub use sink::{
    BufferedSink, FlushCallback, FlushOutcome, MqttRecordSink, PointWriter, RecordSink,
    TimeSeriesRecordSink,
};
pub use topics::{MessageHandler, SubscriptionRegistry, TopicFilter};
pub use transport::{MqttTransport, Transport, TransportEvent};
