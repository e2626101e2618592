//! Multi-consumer fan-out.
//!
//! Each registered consumer owns a bounded queue and a dedicated worker task
//! that pulls records and invokes its sink. The dispatcher enqueues a clone
//! of every record to every live consumer, so a slow or failing sink never
//! affects its siblings or the ingestion path. Shutdown is cooperative: a
//! `Frame::Stop` sentinel per queue, then a bounded join.

use crate::sink::RecordSink;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use skyrelay_common::{FanoutConfig, OverflowPolicy, RelayError, Result, TelemetryRecord};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Queue element: a record to deliver, or the stop sentinel. At most one
/// `Stop` is ever enqueued per consumer and it is the last frame that
/// consumer's worker dequeues.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Record(TelemetryRecord),
    Stop,
}

enum PushOutcome {
    Queued,
    DroppedOldest,
    DroppedNewest,
    Rejected,
}

/// Bounded FIFO shared between the dispatcher and one worker.
struct BoundedQueue {
    items: Mutex<VecDeque<Frame>>,
    capacity: usize,
    policy: OverflowPolicy,
    ready: Notify,
    space: Notify,
    dropped: AtomicU64,
}

impl BoundedQueue {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
            policy,
            ready: Notify::new(),
            space: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking push. Under the `Block` policy a full queue hands the
    /// frame back so the caller can wait for space.
    fn try_push(&self, frame: Frame) -> std::result::Result<PushOutcome, Frame> {
        let mut items = self.items.lock();

        if items.len() < self.capacity {
            items.push_back(frame);
            self.ready.notify_one();
            return Ok(PushOutcome::Queued);
        }

        match self.policy {
            OverflowPolicy::Block => Err(frame),
            OverflowPolicy::DropOldest => {
                items.pop_front();
                items.push_back(frame);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.ready.notify_one();
                Ok(PushOutcome::DroppedOldest)
            }
            OverflowPolicy::DropNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(PushOutcome::DroppedNewest)
            }
        }
    }

    async fn push(&self, frame: Frame) -> PushOutcome {
        let mut frame = frame;
        loop {
            match self.try_push(frame) {
                Ok(outcome) => return outcome,
                Err(returned) => {
                    frame = returned;
                    self.space.notified().await;
                }
            }
        }
    }

    /// Count a frame the caller could not queue without blocking.
    fn reject(&self) -> PushOutcome {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        PushOutcome::Rejected
    }

    /// The sentinel bypasses the capacity bound so it can never be dropped.
    fn push_stop(&self) {
        self.items.lock().push_back(Frame::Stop);
        self.ready.notify_one();
    }

    fn try_pop(&self) -> Option<Frame> {
        let frame = self.items.lock().pop_front();
        if frame.is_some() {
            self.space.notify_one();
        }
        frame
    }

    /// Pull the next frame, waiting at most `wait` so the worker loop can
    /// check its running flag with no traffic.
    async fn pop(&self, wait: Duration) -> Option<Frame> {
        if let Some(frame) = self.try_pop() {
            return Some(frame);
        }
        match timeout(wait, self.ready.notified()).await {
            Ok(()) => self.try_pop(),
            Err(_) => None,
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn depth(&self) -> usize {
        self.items.lock().len()
    }
}

struct ConsumerShared {
    name: String,
    queue: BoundedQueue,
    running: AtomicBool,
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct Consumer {
    shared: Arc<ConsumerShared>,
    join: JoinHandle<()>,
}

/// Per-consumer delivery counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub name: String,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queue_depth: usize,
}

/// Upstream record producer driven by `run_poll_loop`. `poll` returns `None`
/// on "no data" and swallows transient failures.
#[async_trait]
pub trait TelemetrySource: Send {
    async fn poll(&mut self) -> Option<TelemetryRecord>;
}

pub struct FanoutDispatcher {
    config: FanoutConfig,
    consumers: RwLock<Vec<Consumer>>,
    start_tx: watch::Sender<bool>,
    terminating: AtomicBool,
    dispatched: AtomicU64,
}

impl FanoutDispatcher {
    pub fn new(config: FanoutConfig) -> Self {
        let (start_tx, _) = watch::channel(false);
        Self {
            config,
            consumers: RwLock::new(Vec::new()),
            start_tx,
            terminating: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Register a consumer and spawn its worker. The worker blocks on the
    /// start gate until `start` is called, so registration can complete
    /// before any record is processed.
    pub fn add_consumer(&self, name: &str, sink: Arc<dyn RecordSink>) -> Result<()> {
        if self.terminating.load(Ordering::SeqCst) {
            return Err(RelayError::Terminated);
        }

        let shared = Arc::new(ConsumerShared {
            name: name.to_string(),
            queue: BoundedQueue::new(self.config.queue_capacity, self.config.overflow),
            running: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let join = tokio::spawn(worker_loop(
            shared.clone(),
            sink,
            self.start_tx.subscribe(),
            self.config.pop_timeout(),
        ));

        info!(consumer = name, "registered consumer");
        self.consumers.write().push(Consumer { shared, join });
        Ok(())
    }

    /// Release the start gate; every registered worker begins pulling.
    pub fn start(&self) {
        let count = self.consumers.read().len();
        info!(consumers = count, "fan-out started");
        self.start_tx.send_replace(true);
    }

    /// Enqueue a clone of `record` to every live consumer. With the `Block`
    /// overflow policy this waits for queue space; the drop policies return
    /// immediately and count evictions.
    pub async fn dispatch(&self, record: &TelemetryRecord) -> Result<()> {
        let targets = self.live_targets()?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        for shared in targets {
            let outcome = shared.queue.push(Frame::Record(record.clone())).await;
            log_overflow(&shared, outcome);
        }
        Ok(())
    }

    /// Non-blocking dispatch for use inside a broker message handler. Under
    /// the `Block` policy a full queue counts the record as dropped instead
    /// of stalling the broker I/O context.
    pub fn try_dispatch(&self, record: &TelemetryRecord) -> Result<()> {
        let targets = self.live_targets()?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        for shared in targets {
            let outcome = match shared.queue.try_push(Frame::Record(record.clone())) {
                Ok(outcome) => outcome,
                Err(_rejected) => shared.queue.reject(),
            };
            log_overflow(&shared, outcome);
        }
        Ok(())
    }

    fn live_targets(&self) -> Result<Vec<Arc<ConsumerShared>>> {
        if self.terminating.load(Ordering::SeqCst) {
            return Err(RelayError::Terminated);
        }
        Ok(self
            .consumers
            .read()
            .iter()
            .filter(|c| c.shared.running.load(Ordering::Relaxed))
            .map(|c| c.shared.clone())
            .collect())
    }

    /// Poll `source` on the configured interval and dispatch every record
    /// until terminated.
    pub async fn run_poll_loop<S: TelemetrySource>(&self, source: &mut S) -> Result<()> {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.terminating.load(Ordering::SeqCst) {
                return Ok(());
            }

            if let Some(record) = source.poll().await {
                debug!(fields = record.len(), "polled telemetry record");
                match self.dispatch(&record).await {
                    Ok(()) => {}
                    Err(RelayError::Terminated) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Stop every consumer: clear running flags, enqueue one `Stop` sentinel
    /// per queue, then join each worker within the shutdown grace budget. A
    /// worker stuck in a slow sink call past the budget is aborted rather
    /// than hanging shutdown. Idempotent.
    pub async fn terminate(&self) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<Consumer> = {
            let mut consumers = self.consumers.write();
            for consumer in consumers.iter() {
                consumer.shared.running.store(false, Ordering::Relaxed);
                consumer.shared.queue.push_stop();
            }
            consumers.drain(..).collect()
        };

        // Workers still parked on the start gate need it released to drain
        // their sentinel and exit.
        self.start_tx.send_replace(true);

        let grace = self.config.shutdown_grace();
        for consumer in drained {
            let name = consumer.shared.name.clone();
            let abort = consumer.join.abort_handle();
            match timeout(grace, consumer.join).await {
                Ok(Ok(())) => debug!(consumer = %name, "worker joined"),
                Ok(Err(e)) => error!(consumer = %name, error = %e, "worker task failed"),
                Err(_) => {
                    warn!(
                        consumer = %name,
                        grace_ms = grace.as_millis() as u64,
                        "worker did not stop within grace period, aborting"
                    );
                    abort.abort();
                }
            }
        }
        info!("fan-out terminated");
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<ConsumerStats> {
        self.consumers
            .read()
            .iter()
            .map(|c| ConsumerStats {
                name: c.shared.name.clone(),
                delivered: c.shared.delivered.load(Ordering::Relaxed),
                failed: c.shared.failed.load(Ordering::Relaxed),
                dropped: c.shared.queue.dropped(),
                queue_depth: c.shared.queue.depth(),
            })
            .collect()
    }
}

fn log_overflow(shared: &ConsumerShared, outcome: PushOutcome) {
    match outcome {
        PushOutcome::Queued => {}
        PushOutcome::DroppedOldest => warn!(
            consumer = %shared.name,
            dropped = shared.queue.dropped(),
            "queue full, evicted oldest record"
        ),
        PushOutcome::DroppedNewest | PushOutcome::Rejected => warn!(
            consumer = %shared.name,
            dropped = shared.queue.dropped(),
            "queue full, dropped incoming record"
        ),
    }
}

async fn worker_loop(
    shared: Arc<ConsumerShared>,
    sink: Arc<dyn RecordSink>,
    mut start_rx: watch::Receiver<bool>,
    pop_timeout: Duration,
) {
    debug!(consumer = %shared.name, "waiting for start signal");
    if start_rx.wait_for(|started| *started).await.is_err() {
        // Dispatcher dropped before start; nothing to do.
        return;
    }
    info!(consumer = %shared.name, "consumer started");

    loop {
        match shared.queue.pop(pop_timeout).await {
            Some(Frame::Record(record)) => match sink.publish(&record).await {
                Ok(()) => {
                    shared.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    shared.failed.fetch_add(1, Ordering::Relaxed);
                    error!(consumer = %shared.name, error = %e, "sink publish failed");
                }
            },
            Some(Frame::Stop) => break,
            None => {
                if !shared.running.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }

    info!(consumer = %shared.name, "consumer exiting");
}
