//! In-process brokers implementing the transport capability
//!
//! A [`LoopbackNetwork`] hands out one [`LoopbackBroker`] per host name. Brokers
//! route publishes to every matching subscriber, the publisher included, just
//! like a real broker echoing a topic back to a client subscribed to it. Tests
//! and offline runs use them to play the vehicle side: inject telemetry, drop
//! connections, refuse clients, inspect what the remote sent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::config::{BrokerConfig, Qos};
use super::error::TransportError;
use super::lock;
use super::message_manager::MqttMessage;
use super::transport::{AckSender, CloseFuture, Connector, EventSink, Transport, TransportEvent};

/// A publish the broker received from one of its clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

struct LoopbackClient {
    client_id: String,
    sink: EventSink,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, LoopbackClient>,
    next_client: u64,
    refusal: Option<String>,
    published: Vec<PublishedRecord>,
}

impl BrokerState {
    fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for client in self.clients.values() {
            let subscribed = client
                .subscriptions
                .iter()
                .any(|filter| rumqttc::matches(topic, filter));
            if subscribed
                && client
                    .sink
                    .emit(TransportEvent::Message(MqttMessage::from_topic(topic, payload)))
            {
                delivered += 1;
            }
        }
        delivered
    }
}

#[derive(Clone)]
pub struct LoopbackBroker {
    host: String,
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Publishes as the vehicle would. Returns the number of clients reached.
    pub fn inject(&self, topic: &str, payload: impl AsRef<[u8]>) -> usize {
        lock(&self.state).route(topic, payload.as_ref())
    }

    /// Everything clients published, oldest first
    pub fn published(&self) -> Vec<PublishedRecord> {
        lock(&self.state).published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .published
            .iter()
            .filter(|record| record.topic == topic)
            .map(|record| record.payload.clone())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.state).clients.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.state)
            .clients
            .values()
            .filter(|client| {
                client
                    .subscriptions
                    .iter()
                    .any(|filter| rumqttc::matches(topic, filter))
            })
            .count()
    }

    /// New connections are refused with `reason` while set
    pub fn refuse_connections(&self, reason: Option<&str>) {
        lock(&self.state).refusal = reason.map(str::to_string);
    }

    /// Simulates a network drop followed by a successful redial. Broker side
    /// subscriptions are lost, as with a clean session.
    pub fn bounce_connections(&self) {
        let mut state = lock(&self.state);
        for client in state.clients.values_mut() {
            client.subscriptions.clear();
            client.sink.emit(TransportEvent::Reconnecting {
                reason: "connection reset by loopback broker".to_string(),
            });
            client.sink.emit(TransportEvent::Connected);
        }
    }

    /// Drops every client without a redial
    pub fn fail_connections(&self, reason: &str) {
        let mut state = lock(&self.state);
        for (_, client) in state.clients.drain() {
            client.sink.emit(TransportEvent::Failed {
                reason: reason.to_string(),
            });
        }
    }
}

/// Named loopback brokers, keyed by host
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    brokers: Arc<Mutex<HashMap<String, LoopbackBroker>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker for `host`, created on first use
    pub fn broker(&self, host: &str) -> LoopbackBroker {
        lock(&self.brokers)
            .entry(host.to_string())
            .or_insert_with(|| LoopbackBroker {
                host: host.to_string(),
                state: Arc::default(),
            })
            .clone()
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
}

impl Connector for LoopbackConnector {
    fn open(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let broker = self.network.broker(&config.host);
        let mut state = lock(&broker.state);

        let key = state.next_client;
        state.next_client += 1;

        if let Some(reason) = state.refusal.clone() {
            debug!("Loopback broker {} refusing {}", broker.host, config.client_id);
            events.emit(TransportEvent::Failed {
                reason: TransportError::Refused(reason).to_string(),
            });
        } else {
            info!("Loopback broker {} accepted {}", broker.host, config.client_id);
            events.emit(TransportEvent::Connected);
            state.clients.insert(
                key,
                LoopbackClient {
                    client_id: config.client_id.clone(),
                    sink: events,
                    subscriptions: HashSet::new(),
                },
            );
        }
        drop(state);

        Ok(Box::new(LoopbackTransport { broker, key }))
    }
}

pub struct LoopbackTransport {
    broker: LoopbackBroker,
    key: u64,
}

impl LoopbackTransport {
    fn with_client<R>(
        &self,
        f: impl FnOnce(&mut BrokerState, u64) -> R,
    ) -> Result<R, TransportError> {
        let mut state = lock(&self.broker.state);
        if state.clients.contains_key(&self.key) {
            Ok(f(&mut state, self.key))
        } else {
            Err(TransportError::Closed)
        }
    }
}

impl Transport for LoopbackTransport {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        ack: AckSender,
    ) -> Result<(), TransportError> {
        self.with_client(|state, key| {
            let client_id = state
                .clients
                .get(&key)
                .map(|client| client.client_id.clone())
                .unwrap_or_default();
            state.route(topic, &payload);
            state.published.push(PublishedRecord {
                client_id,
                topic: topic.to_string(),
                payload,
                qos,
            });
        })?;
        ack.acknowledge();
        Ok(())
    }

    fn subscribe(&self, filter: &str, _qos: Qos) -> Result<(), TransportError> {
        self.with_client(|state, key| {
            if let Some(client) = state.clients.get_mut(&key) {
                client.subscriptions.insert(filter.to_string());
            }
        })
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.with_client(|state, key| {
            if let Some(client) = state.clients.get_mut(&key) {
                client.subscriptions.remove(filter);
            }
        })
    }

    fn close(self: Box<Self>) -> CloseFuture {
        drop(self);
        Box::pin(async {})
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if lock(&self.broker.state).clients.remove(&self.key).is_some() {
            debug!("Loopback client {} left {}", self.key, self.broker.host);
        }
    }
}
