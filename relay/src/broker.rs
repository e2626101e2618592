//! Broker connection lifecycle.
//!
//! `BrokerConnection` owns the transport and a subscription registry. Its I/O
//! task polls the transport, decodes inbound payloads, and dispatches them
//! through the registry; outbound publishes arrive over a command channel so
//! any task holding a `BrokerHandle` can publish without touching the
//! transport. Disconnects trigger the reconnect backoff schedule unless
//! termination has been requested.

use crate::codec;
use crate::topics::{MessageHandler, SubscriptionRegistry};
use crate::transport::{Transport, TransportEvent};
use skyrelay_common::{BrokerConfig, QoS, RelayError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Terminating,
}

/// Instance-scoped counters, snapshotted through `BrokerHandle::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub published: u64,
    pub received: u64,
    pub dispatched: u64,
    pub decode_failures: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    received: AtomicU64,
    dispatched: AtomicU64,
    decode_failures: AtomicU64,
    reconnects: AtomicU64,
}

enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        pattern: String,
        handler: MessageHandler,
    },
    Terminate,
}

/// Clonable handle for publishing, post-start subscribing, state observation,
/// and termination.
#[derive(Clone)]
pub struct BrokerHandle {
    cmd_tx: mpsc::Sender<Command>,
    terminating: Arc<AtomicBool>,
    term_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<ConnectionState>,
    counters: Arc<Counters>,
}

impl BrokerHandle {
    /// Fire-and-forget publish. Fails with `Terminated` after `terminate`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        if self.is_terminating() {
            return Err(RelayError::Terminated);
        }
        self.cmd_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .await
            .map_err(|_| RelayError::Terminated)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register a subscription on a running connection. Re-subscribing an
    /// existing pattern replaces its handler without another broker-level
    /// subscribe.
    pub async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<()> {
        if self.is_terminating() {
            return Err(RelayError::Terminated);
        }
        self.cmd_tx
            .send(Command::Subscribe {
                pattern: pattern.to_string(),
                handler,
            })
            .await
            .map_err(|_| RelayError::Terminated)
    }

    /// Request termination. Idempotent; safe to call while a reconnect is in
    /// flight (the backoff sleep observes the flag and aborts).
    pub async fn terminate(&self) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.term_tx.send(true);
        let _ = self.cmd_tx.send(Command::Terminate).await;
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reaches `target`. Errors with `Terminated`
    /// if the connection ends first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| RelayError::Terminated)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            published: self.counters.published.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    async fn terminated(&self) {
        let mut rx = self.term_tx.subscribe();
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

pub struct BrokerConnection {
    config: BrokerConfig,
    transport: Box<dyn Transport>,
    registry: SubscriptionRegistry,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    handle: BrokerHandle,
}

impl BrokerConnection {
    pub fn new(config: BrokerConfig, transport: Box<dyn Transport>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (term_tx, _term_rx) = watch::channel(false);

        let handle = BrokerHandle {
            cmd_tx,
            terminating: Arc::new(AtomicBool::new(false)),
            term_tx: Arc::new(term_tx),
            state_rx,
            counters: Arc::new(Counters::default()),
        };

        Self {
            config,
            transport,
            registry: SubscriptionRegistry::new(),
            cmd_rx,
            state_tx,
            handle,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Setup-phase subscribe, before the connection is started. The
    /// broker-level subscribe is issued once connected.
    pub fn subscribe(&mut self, pattern: &str, handler: MessageHandler) -> Result<()> {
        self.registry.register(pattern, handler)?;
        Ok(())
    }

    /// Connect and run the I/O loop until terminated or the reconnect budget
    /// is exhausted.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.connect_with_backoff().await {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            self.state_tx.send_replace(ConnectionState::Terminating);
            return match e {
                RelayError::Terminated => Ok(()),
                other => Err(other),
            };
        }

        let result = self.io_loop().await;

        // Disconnected is the observable transport outcome; Terminating is
        // the absorbing final state.
        self.state_tx.send_replace(ConnectionState::Disconnected);
        let _ = self.transport.disconnect().await;
        self.state_tx.send_replace(ConnectionState::Terminating);
        info!("broker connection terminated");
        match result {
            Err(RelayError::Terminated) => Ok(()),
            other => other,
        }
    }

    async fn io_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Publish { topic, payload, qos, retain }) => {
                        if let Err(e) = self.transport.publish(&topic, payload, qos, retain).await {
                            warn!(topic = %topic, error = %e, "publish failed");
                        }
                    }
                    Some(Command::Subscribe { pattern, handler }) => {
                        match self.registry.register(&pattern, handler) {
                            Ok(true) => {
                                if let Err(e) = self.transport.subscribe(&pattern, self.config.qos).await {
                                    warn!(pattern = %pattern, error = %e, "broker-level subscribe failed");
                                }
                            }
                            Ok(false) => {}
                            Err(e) => warn!(pattern = %pattern, error = %e, "rejected subscription"),
                        }
                    }
                    Some(Command::Terminate) | None => return Ok(()),
                },
                event = self.transport.poll() => match event {
                    Ok(TransportEvent::Message { topic, payload }) => {
                        self.on_message(&topic, &payload);
                    }
                    Ok(TransportEvent::Disconnected) | Err(_) => {
                        if self.handle.is_terminating() {
                            return Ok(());
                        }
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        warn!("broker connection dropped, reconnecting");
                        self.handle.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.connect_with_backoff().await?;
                    }
                },
            }
        }
    }

    /// Exponential backoff connect: sleep first_delay, doubling per retry up
    /// to max_delay, for max_attempts retries; the next failure is fatal.
    /// Aborts promptly when termination is signalled mid-sleep.
    async fn connect_with_backoff(&mut self) -> Result<()> {
        let policy = self.config.reconnect.clone();
        self.state_tx.send_replace(ConnectionState::Connecting);

        let mut retry: u32 = 0;
        loop {
            if self.handle.is_terminating() {
                return Err(RelayError::Terminated);
            }

            match self.transport.connect().await {
                Ok(()) => {
                    self.state_tx.send_replace(ConnectionState::Connected);
                    info!(
                        host = %self.config.host,
                        port = self.config.port,
                        "connected to broker"
                    );
                    self.resubscribe().await;
                    return Ok(());
                }
                Err(e) => {
                    if retry >= policy.max_attempts {
                        error!(
                            attempts = retry,
                            error = %e,
                            "reconnect budget exhausted, giving up"
                        );
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        return Err(RelayError::ReconnectExhausted { attempts: retry });
                    }

                    let delay = policy.delay_for(retry);
                    retry += 1;
                    warn!(
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect failed, retrying"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.handle.terminated() => return Err(RelayError::Terminated),
                    }
                }
            }
        }
    }

    /// Issue the broker-level subscribe for every registered pattern. Runs on
    /// every (re)connect so subscriptions survive a dropped session.
    async fn resubscribe(&mut self) {
        let patterns: Vec<String> = self.registry.patterns().map(String::from).collect();
        for pattern in patterns {
            if let Err(e) = self.transport.subscribe(&pattern, self.config.qos).await {
                warn!(pattern = %pattern, error = %e, "broker-level subscribe failed");
            }
        }
    }

    fn on_message(&mut self, topic: &str, payload: &[u8]) {
        self.handle.counters.received.fetch_add(1, Ordering::Relaxed);

        match codec::decode(payload) {
            Ok(envelope) => {
                let invoked = self.registry.match_and_dispatch(topic, &envelope);
                self.handle
                    .counters
                    .dispatched
                    .fetch_add(invoked as u64, Ordering::Relaxed);
                if invoked == 0 {
                    debug!(topic, "no subscription matched");
                }
            }
            Err(e) => {
                self.handle
                    .counters
                    .decode_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(topic, error = %e, "dropping malformed payload");
            }
        }
    }
}
