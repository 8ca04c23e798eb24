//! rumqttc-backed transport
//!
//! Every connection gets its own driver task that polls the rumqttc event loop.
//! The driver walks a small typestate machine:
//!
//! ```text
//! Dialing ──► Online ──► Dialing (connection lost, redial after reconnect period)
//!    │           │
//!    └─► Closed ◄┘  (cancelled, refused, or reconnect disabled)
//! ```
//!
//! Redialing is owned entirely by the driver; the session only sees
//! `Reconnecting` and `Connected` events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing,
    Packet, Transport as WireTransport,
};
use statum::{machine, state};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::{BrokerConfig, Protocol, Qos};
use super::error::TransportError;
use super::lock;
use super::message_manager::MqttMessage;
use super::transport::{
    AckBook, AckSender, CloseFuture, Connector, EventSink, Transport, TransportEvent,
};

/// Bound of the queue between callers and the event loop. When it is full,
/// publish and subscribe fail instead of blocking.
const REQUEST_CAPACITY: usize = 100;

/// Opens rumqttc connections
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttConnector;

fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, config.broker_address(), config.port);
    options
        .set_keep_alive(Duration::from_secs(u64::from(config.keepalive_secs)))
        .set_clean_session(config.clean_session);

    if let Some(credentials) = &config.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    if let Some(will) = &config.last_will {
        options.set_last_will(rumqttc::LastWill::new(
            &will.topic,
            will.payload.as_bytes().to_vec(),
            will.qos.into(),
            will.retain,
        ));
    }

    match config.protocol {
        Protocol::Mqtt => {}
        Protocol::Mqtts => {
            options.set_transport(WireTransport::tls_with_default_config());
        }
        Protocol::Ws => {
            options.set_transport(WireTransport::Ws);
        }
        Protocol::Wss => {
            options.set_transport(WireTransport::wss_with_default_config());
        }
    }

    options
}

/// rumqttc gives up on a dial after its own connection timeout, which only
/// counts whole seconds and defaults to 5.
fn network_options(config: &BrokerConfig) -> NetworkOptions {
    let mut options = NetworkOptions::new();
    options.set_connection_timeout(config.connect_timeout_ms.div_ceil(1000).max(1));
    options
}

impl Connector for RumqttConnector {
    fn open(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        info!(
            "Opening connection {} to {} as {}",
            events.generation(),
            config,
            config.client_id
        );

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        eventloop.set_network_options(network_options(config));
        let acks = Arc::new(Mutex::new(AckBook::default()));
        let cancel = CancellationToken::new();

        let link = Link::<Dialing>::create(
            eventloop,
            events,
            acks.clone(),
            cancel.clone(),
            Duration::from_millis(config.reconnect_period_ms),
            Duration::from_millis(config.connect_timeout_ms),
        );
        let driver = tokio::spawn(drive(link));

        Ok(Box::new(RumqttTransport {
            client,
            acks,
            cancel,
            driver: Some(driver),
        }))
    }
}

pub struct RumqttTransport {
    client: AsyncClient,
    acks: Arc<Mutex<AckBook>>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Transport for RumqttTransport {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        ack: AckSender,
    ) -> Result<(), TransportError> {
        // Queue order must equal the order acks are booked in
        let mut book = lock(&self.acks);
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.client.try_publish(topic, qos.into(), false, payload)?;
        book.enqueue(qos, ack);
        Ok(())
    }

    fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.client.try_subscribe(filter, qos.into())?;
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.client.try_unsubscribe(filter)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> CloseFuture {
        self.cancel.cancel();
        let driver = self.driver.take();
        let acks = self.acks.clone();

        Box::pin(async move {
            if let Some(driver) = driver {
                if let Err(e) = driver.await {
                    error!("Connection driver ended abnormally: {}", e);
                }
            }
            lock(&acks).fail_all();
        })
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Dialing, // waiting for CONNACK
    Online,  // routing packets
    Closed,  // driver finished
}

#[machine]
pub struct Link<S: LinkState> {
    eventloop: EventLoop,
    events: EventSink,
    acks: Arc<Mutex<AckBook>>,
    cancel: CancellationToken,
    reconnect_period: Duration,
    connect_timeout: Duration,
}

enum Dialed {
    Online(Link<Online>),
    Closed(Link<Closed>),
}

enum Served {
    Redial(Link<Dialing>),
    Closed(Link<Closed>),
}

impl Link<Dialing> {
    fn create(
        eventloop: EventLoop,
        events: EventSink,
        acks: Arc<Mutex<AckBook>>,
        cancel: CancellationToken,
        reconnect_period: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self::new(
            eventloop,
            events,
            acks,
            cancel,
            reconnect_period,
            connect_timeout,
        )
    }

    /// Dials until the broker answers with a successful CONNACK
    async fn establish(mut self) -> Dialed {
        loop {
            let attempt = tokio::time::timeout(self.connect_timeout, self.eventloop.poll());
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Dialed::Closed(self.transition()),
                outcome = attempt => outcome,
            };

            let reason = match outcome {
                Ok(Ok(Event::Incoming(Packet::ConnAck(connack)))) => {
                    info!(
                        "Connection {} established (session present: {})",
                        self.events.generation(),
                        connack.session_present
                    );
                    self.events.emit(TransportEvent::Connected);
                    return Dialed::Online(self.transition());
                }
                Ok(Ok(event)) => {
                    trace!("Ignoring {:?} before CONNACK", event);
                    continue;
                }
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    let reason = TransportError::Refused(format!("{:?}", code)).to_string();
                    error!("Connection {}: {}", self.events.generation(), reason);
                    self.events.emit(TransportEvent::Failed { reason });
                    return Dialed::Closed(self.transition());
                }
                Ok(Err(ConnectionError::RequestsDone)) => {
                    debug!("Client handle dropped while dialing");
                    return Dialed::Closed(self.transition());
                }
                Ok(Err(e)) => TransportError::from(e).to_string(),
                Err(_) => TransportError::ConnectTimeout(self.connect_timeout.as_millis() as u64)
                    .to_string(),
            };

            if self.reconnect_period.is_zero() {
                error!(
                    "Connection {} failed and reconnect is disabled: {}",
                    self.events.generation(),
                    reason
                );
                self.events.emit(TransportEvent::Failed { reason });
                return Dialed::Closed(self.transition());
            }

            warn!(
                "Connection {} dial failed, retrying in {:?}: {}",
                self.events.generation(),
                self.reconnect_period,
                reason
            );
            self.events.emit(TransportEvent::Reconnecting { reason });

            tokio::select! {
                _ = self.cancel.cancelled() => return Dialed::Closed(self.transition()),
                _ = tokio::time::sleep(self.reconnect_period) => {}
            }
        }
    }
}

impl Link<Online> {
    /// Routes packets until the connection drops or the transport is closed
    async fn serve(mut self) -> Served {
        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => return Served::Closed(self.transition()),
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!("Received publish on {}", publish.topic);
                    let message = MqttMessage::from_topic(publish.topic, publish.payload.to_vec());
                    if !self.events.emit(TransportEvent::Message(message)) {
                        debug!("Dispatcher gone, stopping connection driver");
                        return Served::Closed(self.transition());
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(puback))) => {
                    lock(&self.acks).acknowledged(puback.pkid);
                }
                Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                    lock(&self.acks).acknowledged(pubcomp.pkid);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    lock(&self.acks).written(pkid);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.events.emit(TransportEvent::Connected);
                }
                Ok(event) => trace!("Event: {:?}", event),
                Err(ConnectionError::RequestsDone) => {
                    debug!("Client handle dropped, stopping connection driver");
                    return Served::Closed(self.transition());
                }
                Err(e) => {
                    let reason = TransportError::from(e).to_string();
                    if self.reconnect_period.is_zero() {
                        error!(
                            "Connection {} lost and reconnect is disabled: {}",
                            self.events.generation(),
                            reason
                        );
                        self.events.emit(TransportEvent::Failed { reason });
                        return Served::Closed(self.transition());
                    }

                    warn!(
                        "Connection {} lost, redialing in {:?}: {}",
                        self.events.generation(),
                        self.reconnect_period,
                        reason
                    );
                    self.events.emit(TransportEvent::Reconnecting { reason });

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Served::Closed(self.transition()),
                        _ = tokio::time::sleep(self.reconnect_period) => {}
                    }
                    return Served::Redial(self.transition());
                }
            }
        }
    }
}

impl Link<Closed> {
    fn release(self) {
        lock(&self.acks).fail_all();
        debug!("Connection {} driver stopped", self.events.generation());
    }
}

async fn drive(link: Link<Dialing>) {
    let mut dialing = link;
    let closed = loop {
        let online = match dialing.establish().await {
            Dialed::Online(online) => online,
            Dialed::Closed(closed) => break closed,
        };
        dialing = match online.serve().await {
            Served::Redial(redial) => redial,
            Served::Closed(closed) => break closed,
        };
    };
    closed.release();
}
