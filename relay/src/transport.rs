//! Transport seam between the broker connection and the wire.
//!
//! `BrokerConnection` drives a `Transport` and never touches the MQTT client
//! directly, so connection-lifecycle logic stays testable without a broker.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet};
use skyrelay_common::{BrokerConfig, QoS, RelayError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Inbound activity surfaced to the connection's I/O loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { topic: String, payload: Vec<u8> },
    Disconnected,
}

#[async_trait]
pub trait Transport: Send {
    /// Establish (or re-establish) the connection. A failed attempt leaves the
    /// transport disconnected and may be retried.
    async fn connect(&mut self) -> Result<()>;

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<()>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Wait for the next inbound event. Transport-level failures surface as
    /// `TransportEvent::Disconnected`, not as errors.
    async fn poll(&mut self) -> Result<TransportEvent>;
}

/// MQTT transport over rumqttc. The async client handles outbound traffic;
/// the event loop is polled by the connection's I/O task.
pub struct MqttTransport {
    config: BrokerConfig,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            client: None,
            event_loop: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.client
            .as_ref()
            .ok_or_else(|| RelayError::Connection("transport not connected".to_string()))
    }

    fn to_rumqtt_qos(qos: QoS) -> rumqttc::QoS {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<()> {
        // Discard any previous session state before handshaking again.
        self.client = None;
        self.event_loop = None;

        let (client, mut event_loop) = AsyncClient::new(self.options(), 64);

        // Wait for the broker's CONNACK before reporting success.
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(RelayError::Connection(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => continue,
                Err(e) => return Err(RelayError::Connection(e.to_string())),
            }
        }

        self.client = Some(client);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<()> {
        self.client()?
            .subscribe(filter, Self::to_rumqtt_qos(qos))
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.client()?
            .publish(topic, Self::to_rumqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "disconnect while already closed");
            }
        }
        self.event_loop = None;
        Ok(())
    }

    async fn poll(&mut self) -> Result<TransportEvent> {
        let event_loop = self
            .event_loop
            .as_mut()
            .ok_or_else(|| RelayError::Connection("transport not connected".to_string()))?;

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(TransportEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Ok(TransportEvent::Disconnected);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "mqtt event loop error");
                    return Ok(TransportEvent::Disconnected);
                }
            }
        }
    }
}
