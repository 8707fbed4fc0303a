//! MQTT subscription over the forwarded tunnel endpoint.
//!
//! The ingestion loop drives a [`BrokerSession`] in short time-boxed polls so
//! it can re-check tunnel liveness between them. [`MqttSession`] implements
//! it with the pure Rust `rumqttc` client.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::InboundMessage;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("mqtt connection: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("mqtt client: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("subscription to {0} was rejected")]
    SubscribeRejected(String),

    #[error("broker session closed")]
    Closed,
}

/// A subscribed (or subscribing) broker client.
#[async_trait]
pub trait BrokerSession: Send {
    /// Subscribe and wait until the broker acknowledges it.
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Wait at most `slice` for the next message. `Ok(None)` means nothing
    /// arrived in time.
    async fn poll(&mut self, slice: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    /// Disconnect from the broker. Safe to repeat.
    async fn disconnect(&mut self);
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    pending: VecDeque<InboundMessage>,
    connected: bool,
}

impl MqttSession {
    /// Prepare a persistent-session client. The network connection is made
    /// lazily by the first poll.
    pub fn new(client_id: &str, host: &str, port: u16, max_packet_size: usize) -> Self {
        let options = mqtt_options(client_id, host, port, max_packet_size);

        info!("MQTT client connecting to {}:{}", host, port);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            eventloop,
            pending: VecDeque::new(),
            connected: true,
        }
    }

    fn publish_to_message(publish: rumqttc::Publish) -> InboundMessage {
        InboundMessage {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }
    }
}

/// Client options for a persistent session. `max_packet_size` bounds both
/// directions; an incoming packet above it fails the connection.
pub fn mqtt_options(client_id: &str, host: &str, port: u16, max_packet_size: usize) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_max_packet_size(max_packet_size, max_packet_size);
    // rumqttc refuses a persistent session without a client id.
    options.set_clean_session(client_id.is_empty());
    options
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::Closed);
        }
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;

        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    info!("MQTT connected (session present: {})", ack.session_present);
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(BrokerError::SubscribeRejected(topic.to_string()));
                    }
                    info!("Subscribed to {}", topic);
                    return Ok(());
                }
                // Persistent sessions may replay queued messages before the ack.
                Event::Incoming(Packet::Publish(publish)) => {
                    self.pending.push_back(Self::publish_to_message(publish));
                }
                other => debug!("mqtt event while subscribing: {:?}", other),
            }
        }
    }

    async fn poll(&mut self, slice: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        if !self.connected {
            return Err(BrokerError::Closed);
        }

        match tokio::time::timeout(slice, self.eventloop.poll()).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                Ok(Some(Self::publish_to_message(publish)))
            }
            Ok(Ok(Event::Incoming(Packet::Disconnect))) => Err(BrokerError::Closed),
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.pending.clear();
        if let Err(e) = self.client.try_disconnect() {
            debug!("mqtt disconnect: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_keep_session_and_packet_limit() {
        let options = mqtt_options("ydev2db-lab", "127.0.0.1", 41883, 1024 * 1024);
        assert!(!options.clean_session());
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert_eq!(options.max_packet_size(), 1024 * 1024);
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 41883));
    }

    #[test]
    fn test_empty_client_id_uses_clean_session() {
        let options = mqtt_options("", "127.0.0.1", 1883, 4096);
        assert!(options.clean_session());
    }
}
