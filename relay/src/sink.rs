//! Sink contracts and the buffered time-series write path.
//!
//! `RecordSink` is what a consumer worker invokes per record. `BufferedSink`
//! batches points by count and by a flush interval in front of a
//! `PointWriter`; `write` means "accepted into buffer", and flush results are
//! reported through an asynchronous callback, never through `write`'s return
//! value.

use crate::broker::BrokerHandle;
use crate::codec;
use async_trait::async_trait;
use skyrelay_common::{BufferConfig, Point, QoS, RelayError, Result, TelemetryRecord};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Downstream publish contract invoked by a consumer worker. Errors are
/// caught and logged at the worker; they never propagate to the dispatcher.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn publish(&self, record: &TelemetryRecord) -> Result<()>;
}

/// Storage seam behind `BufferedSink`. Implementations wrap a concrete
/// time-series client.
#[async_trait]
pub trait PointWriter: Send + Sync {
    /// Write a batch, returning the number of points written.
    async fn write_batch(&self, points: &[Point]) -> Result<usize>;
}

/// Result of one flush attempt, delivered through the flush callback.
#[derive(Debug)]
pub enum FlushOutcome {
    Flushed(usize),
    Failed { error: RelayError, dropped: usize },
}

pub type FlushCallback = Arc<dyn Fn(FlushOutcome) + Send + Sync>;

enum SinkCommand {
    Write(Point),
    Shutdown,
}

/// Batching front for a `PointWriter`.
pub struct BufferedSink {
    tx: mpsc::Sender<SinkCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedSink {
    pub fn spawn(writer: Arc<dyn PointWriter>, config: BufferConfig, on_flush: FlushCallback) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let task = tokio::spawn(flush_loop(writer, config, on_flush, rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Accept a point into the buffer. Success means buffered, not stored.
    pub async fn write(&self, point: Point) -> Result<()> {
        self.tx
            .send(SinkCommand::Write(point))
            .await
            .map_err(|_| RelayError::Terminated)
    }

    /// Flush the remaining buffer and stop the background task. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        let Some(task) = task else {
            return Ok(());
        };

        let _ = self.tx.send(SinkCommand::Shutdown).await;
        task.await
            .map_err(|e| RelayError::Sink(format!("flush task failed: {}", e)))
    }
}

async fn flush_loop(
    writer: Arc<dyn PointWriter>,
    config: BufferConfig,
    on_flush: FlushCallback,
    mut rx: mpsc::Receiver<SinkCommand>,
) {
    let mut batch: Vec<Point> = Vec::with_capacity(config.flush_size);
    let mut ticker = interval(config.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(SinkCommand::Write(point)) => {
                    batch.push(point);
                    if batch.len() >= config.flush_size {
                        flush(&writer, &mut batch, &on_flush).await;
                    }
                }
                Some(SinkCommand::Shutdown) | None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&writer, &mut batch, &on_flush).await;
                }
            }
        }
    }

    // Drain writes accepted before the shutdown command.
    loop {
        match rx.try_recv() {
            Ok(SinkCommand::Write(point)) => batch.push(point),
            Ok(SinkCommand::Shutdown) => continue,
            Err(_) => break,
        }
    }
    if !batch.is_empty() {
        flush(&writer, &mut batch, &on_flush).await;
    }
    debug!("buffered sink stopped");
}

async fn flush(writer: &Arc<dyn PointWriter>, batch: &mut Vec<Point>, on_flush: &FlushCallback) {
    let points = std::mem::take(batch);
    match writer.write_batch(&points).await {
        Ok(written) => {
            debug!(written, "flushed points");
            on_flush(FlushOutcome::Flushed(written));
        }
        Err(error) => {
            warn!(error = %error, dropped = points.len(), "point flush failed");
            on_flush(FlushOutcome::Failed {
                error,
                dropped: points.len(),
            });
        }
    }
}

/// Sink that re-publishes records to the broker under the
/// `Carrier/TailNumber/FlightNumber/Source` topic scheme.
pub struct MqttRecordSink {
    broker: BrokerHandle,
    carrier: String,
    source: String,
    qos: QoS,
    retain: bool,
}

impl MqttRecordSink {
    pub fn new(
        broker: BrokerHandle,
        carrier: impl Into<String>,
        source: impl Into<String>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            broker,
            carrier: carrier.into(),
            source: source.into(),
            qos,
            retain,
        }
    }
}

#[async_trait]
impl RecordSink for MqttRecordSink {
    async fn publish(&self, record: &TelemetryRecord) -> Result<()> {
        let topic = codec::record_topic(&self.carrier, &self.source, record)?;
        let payload = codec::encode(record)?;
        debug!(topic = %topic, "publishing telemetry record");
        self.broker.publish(&topic, payload, self.qos, self.retain).await
    }
}

/// Sink that converts records into points for a buffered time-series write.
/// Fields named in `tag_fields` become tags; the rest become point fields.
pub struct TimeSeriesRecordSink {
    buffer: Arc<BufferedSink>,
    measurement: String,
    tag_fields: Vec<String>,
}

impl TimeSeriesRecordSink {
    pub fn new(
        buffer: Arc<BufferedSink>,
        measurement: impl Into<String>,
        tag_fields: Vec<String>,
    ) -> Self {
        Self {
            buffer,
            measurement: measurement.into(),
            tag_fields,
        }
    }
}

#[async_trait]
impl RecordSink for TimeSeriesRecordSink {
    async fn publish(&self, record: &TelemetryRecord) -> Result<()> {
        let mut point = Point::new(self.measurement.clone(), record.captured_at());

        for name in &self.tag_fields {
            if let Some(value) = record.field(name) {
                if !value.is_null() {
                    point = point.tag(name.clone(), value.to_string());
                }
            }
        }

        for (key, value) in record.iter() {
            if value.is_null() || self.tag_fields.contains(key) {
                continue;
            }
            point = point.field(key.clone(), value.clone());
        }

        self.buffer.write(point).await
    }
}
