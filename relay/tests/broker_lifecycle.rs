//! Broker connection lifecycle tests against a scripted transport:
//! reconnect backoff schedule, idempotent subscribe, malformed payload
//! handling, and cooperative termination.

use async_trait::async_trait;
use parking_lot::Mutex;
use skyrelay_common::{BrokerConfig, QoS, ReconnectPolicy, RelayError, Result, TelemetryRecord};
use skyrelay_core::broker::{BrokerConnection, ConnectionState};
use skyrelay_core::codec;
use skyrelay_core::transport::{Transport, TransportEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_test::assert_ok;

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Shared view into the mock transport so tests keep probing after the
/// transport moves into the connection.
#[derive(Clone)]
struct TransportProbe {
    connects: Arc<Mutex<Vec<Instant>>>,
    fail_connects: Arc<AtomicU32>,
    subscribes: Arc<Mutex<Vec<String>>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    events: Arc<Mutex<VecDeque<TransportEvent>>>,
    event_ready: Arc<Notify>,
}

impl TransportProbe {
    fn new(fail_connects: u32) -> Self {
        Self {
            connects: Arc::new(Mutex::new(Vec::new())),
            fail_connects: Arc::new(AtomicU32::new(fail_connects)),
            subscribes: Arc::new(Mutex::new(Vec::new())),
            published: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(VecDeque::new())),
            event_ready: Arc::new(Notify::new()),
        }
    }

    fn inject(&self, event: TransportEvent) {
        self.events.lock().push_back(event);
        self.event_ready.notify_one();
    }

    fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            probe: self.clone(),
            attempts: 0,
        })
    }
}

struct MockTransport {
    probe: TransportProbe,
    attempts: u32,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        self.probe.connects.lock().push(Instant::now());
        let attempt = self.attempts;
        self.attempts += 1;
        if attempt < self.probe.fail_connects.load(Ordering::SeqCst) {
            return Err(RelayError::Connection("mock refused".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, _qos: QoS) -> Result<()> {
        self.probe.subscribes.lock().push(filter.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QoS,
        _retain: bool,
    ) -> Result<()> {
        self.probe.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Teardown yields like a real transport call, so state observers get
        // scheduled between the disconnect and the terminal state.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn poll(&mut self) -> Result<TransportEvent> {
        loop {
            if let Some(event) = self.probe.events.lock().pop_front() {
                return Ok(event);
            }
            self.probe.event_ready.notified().await;
        }
    }
}

fn config_with_attempts(max_attempts: u32) -> BrokerConfig {
    BrokerConfig {
        reconnect: ReconnectPolicy {
            first_delay_ms: 1_000,
            rate: 2.0,
            max_delay_ms: 60_000,
            max_attempts,
        },
        ..BrokerConfig::default()
    }
}

fn valid_payload() -> Vec<u8> {
    codec::encode(&TelemetryRecord::now().with("altitude", 35_000i64)).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_doubles_then_goes_fatal() {
    init_tracing();
    let probe = TransportProbe::new(u32::MAX);
    let conn = BrokerConnection::new(config_with_attempts(3), probe.transport());

    let result = conn.run().await;
    assert!(matches!(
        result,
        Err(RelayError::ReconnectExhausted { attempts: 3 })
    ));

    let connects = probe.connects.lock();
    assert_eq!(connects.len(), 4, "three retries after the initial attempt");
    let deltas: Vec<u64> = connects
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(deltas, vec![1_000, 2_000, 4_000]);
}

#[tokio::test(start_paused = true)]
async fn terminate_aborts_inflight_backoff() {
    init_tracing();
    let probe = TransportProbe::new(u32::MAX);
    let conn = BrokerConnection::new(config_with_attempts(12), probe.transport());
    let handle = conn.handle();
    let task = tokio::spawn(conn.run());

    // Let a couple of backoff sleeps begin, then pull the plug.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    handle.terminate().await;

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("terminate did not interrupt the backoff")
        .unwrap();
    assert_ok!(result);
}

#[tokio::test]
async fn resubscribe_replaces_handler_without_second_broker_subscribe() {
    init_tracing();
    let probe = TransportProbe::new(0);
    let mut conn = BrokerConnection::new(config_with_attempts(3), probe.transport());

    let h1_hits = Arc::new(Mutex::new(0u32));
    let h2_hits = Arc::new(Mutex::new(0u32));

    let hits = h1_hits.clone();
    conn.subscribe("T/#", Arc::new(move |_, _| *hits.lock() += 1))
        .unwrap();
    let hits = h2_hits.clone();
    conn.subscribe("T/#", Arc::new(move |_, _| *hits.lock() += 1))
        .unwrap();

    let handle = conn.handle();
    let task = tokio::spawn(conn.run());
    handle.wait_for_state(ConnectionState::Connected).await.unwrap();

    probe.inject(TransportEvent::Message {
        topic: "T/a".to_string(),
        payload: valid_payload(),
    });

    let h = handle.clone();
    wait_until(move || h.stats().dispatched >= 1).await;

    assert_eq!(*probe.subscribes.lock(), vec!["T/#".to_string()]);
    assert_eq!(*h1_hits.lock(), 0, "replaced handler must not fire");
    assert_eq!(*h2_hits.lock(), 1);

    handle.terminate().await;
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_ingestion_continues() {
    init_tracing();
    let probe = TransportProbe::new(0);
    let mut conn = BrokerConnection::new(config_with_attempts(3), probe.transport());

    let hits = Arc::new(Mutex::new(0u32));
    let h = hits.clone();
    conn.subscribe("Delta/#", Arc::new(move |_, _| *h.lock() += 1))
        .unwrap();

    let handle = conn.handle();
    let task = tokio::spawn(conn.run());
    handle.wait_for_state(ConnectionState::Connected).await.unwrap();

    probe.inject(TransportEvent::Message {
        topic: "Delta/N304DL".to_string(),
        payload: b"{ not json".to_vec(),
    });
    probe.inject(TransportEvent::Message {
        topic: "Delta/N304DL".to_string(),
        payload: valid_payload(),
    });

    let h = handle.clone();
    wait_until(move || h.stats().dispatched >= 1).await;

    let stats = handle.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(*hits.lock(), 1);

    handle.terminate().await;
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn unsolicited_disconnect_reconnects_and_resubscribes() {
    init_tracing();
    let probe = TransportProbe::new(0);
    let mut conn = BrokerConnection::new(config_with_attempts(3), probe.transport());
    conn.subscribe("Delta/#", Arc::new(|_, _| {})).unwrap();

    let handle = conn.handle();
    let task = tokio::spawn(conn.run());
    handle.wait_for_state(ConnectionState::Connected).await.unwrap();

    probe.inject(TransportEvent::Disconnected);

    let h = handle.clone();
    wait_until(move || h.stats().reconnects >= 1).await;
    handle.wait_for_state(ConnectionState::Connected).await.unwrap();

    let p = probe.clone();
    wait_until(move || p.subscribes.lock().len() == 2).await;

    handle.terminate().await;
    assert_ok!(task.await.unwrap());
}

#[tokio::test]
async fn publish_is_counted_and_fails_after_terminate() {
    init_tracing();
    let probe = TransportProbe::new(0);
    let conn = BrokerConnection::new(config_with_attempts(3), probe.transport());
    let handle = conn.handle();
    let task = tokio::spawn(conn.run());
    handle.wait_for_state(ConnectionState::Connected).await.unwrap();

    handle
        .publish("Delta/N304DL/DL77/MSI", valid_payload(), QoS::AtMostOnce, false)
        .await
        .unwrap();

    let p = probe.clone();
    wait_until(move || p.published.lock().len() == 1).await;
    assert_eq!(handle.stats().published, 1);

    handle.terminate().await;
    assert_ok!(task.await.unwrap());

    assert!(matches!(
        handle
            .publish("Delta/N304DL/DL77/MSI", Vec::new(), QoS::AtMostOnce, false)
            .await,
        Err(RelayError::Terminated)
    ));
    assert_eq!(handle.state(), ConnectionState::Terminating);
    assert_eq!(handle.stats().published, 1);
}

#[tokio::test]
async fn terminate_publishes_disconnected_before_terminating() {
    init_tracing();
    let probe = TransportProbe::new(0);
    let conn = BrokerConnection::new(config_with_attempts(3), probe.transport());
    let handle = conn.handle();
    let task = tokio::spawn(conn.run());
    handle.wait_for_state(ConnectionState::Connected).await.unwrap();

    // Park an observer on the watch before requesting termination.
    let h = handle.clone();
    let observer =
        tokio::spawn(async move { h.wait_for_state(ConnectionState::Disconnected).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    handle.terminate().await;
    assert_ok!(task.await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), observer)
        .await
        .expect("disconnected state was never observable")
        .unwrap()
        .unwrap();
    assert_eq!(handle.state(), ConnectionState::Terminating);
}

#[tokio::test]
async fn failed_publish_is_not_counted() {
    init_tracing();
    let probe = TransportProbe::new(0);
    let conn = BrokerConnection::new(config_with_attempts(3), probe.transport());
    let handle = conn.handle();

    // Connection dropped before running: the command channel is closed but
    // no terminate was requested.
    drop(conn);

    assert!(matches!(
        handle
            .publish("Delta/N304DL/DL77/MSI", valid_payload(), QoS::AtMostOnce, false)
            .await,
        Err(RelayError::Terminated)
    ));
    assert_eq!(handle.stats().published, 0);
}
