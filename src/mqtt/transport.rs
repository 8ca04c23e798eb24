//! Transport capability the session is written against
//!
//! A [`Connector`] opens one [`Transport`] per broker connection. The transport
//! reports everything that happens on the wire through an [`EventSink`] that
//! tags each event with the generation of the connection that produced it, so
//! the session can drop events from a connection it has already replaced.
//!
//! Publish acknowledgments never travel through the event stream. Each
//! publish carries its own [`AckSender`] which the transport resolves exactly
//! once: `Ok` when the broker acknowledged (or the QoS 0 write was flushed),
//! `Err(ConnectionClosed)` when the connection went away first.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::config::{BrokerConfig, Qos};
use super::error::{SessionError, TransportError};
use super::message_manager::MqttMessage;

pub type CloseFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// What a transport observed on its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker accepted the connection (initial connect or a redial)
    Connected,
    /// Connection lost or dial failed; the transport keeps retrying
    Reconnecting { reason: String },
    Message(MqttMessage),
    /// Unrecoverable, the transport has stopped
    Failed { reason: String },
}

/// Generation-tagged sender handed to a transport when it is opened
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session's dispatcher is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Resolves one publish acknowledgment
#[derive(Debug)]
pub struct AckSender(oneshot::Sender<Result<(), SessionError>>);

impl AckSender {
    pub fn acknowledge(self) {
        let _ = self.0.send(Ok(()));
    }

    pub fn fail(self, error: SessionError) {
        let _ = self.0.send(Err(error));
    }
}

/// Awaitable acknowledgment of a publish.
///
/// Dropping it is fine, the transport does not care whether anyone listens.
#[derive(Debug)]
pub struct PublishAck(oneshot::Receiver<Result<(), SessionError>>);

impl PublishAck {
    pub fn pair() -> (AckSender, PublishAck) {
        let (tx, rx) = oneshot::channel();
        (AckSender(tx), PublishAck(rx))
    }

    pub async fn wait(self) -> Result<(), SessionError> {
        match self.0.await {
            Ok(result) => result,
            // sender dropped without answering
            Err(_) => Err(SessionError::ConnectionClosed),
        }
    }
}

/// Opens transports for a broker config
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// One live broker connection, exclusively owned by a session.
///
/// All request methods only enqueue; they never wait for the network.
pub trait Transport: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        ack: AckSender,
    ) -> Result<(), TransportError>;

    fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), TransportError>;

    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Forcibly stops the connection. The returned future completes once the
    /// socket and every timer of this transport are released and all pending
    /// acknowledgments have been failed.
    fn close(self: Box<Self>) -> CloseFuture;
}

/// Packet-id bookkeeping for publish acknowledgments.
///
/// Publishes are handed to the event loop in the order they were queued, so
/// the n-th outgoing publish belongs to the n-th queued ack. QoS 0 is done
/// once written, QoS 1/2 wait for PUBACK/PUBCOMP with the assigned packet id.
#[derive(Debug, Default)]
pub struct AckBook {
    queued: VecDeque<(Qos, AckSender)>,
    in_flight: HashMap<u16, AckSender>,
}

impl AckBook {
    pub fn enqueue(&mut self, qos: Qos, ack: AckSender) {
        self.queued.push_back((qos, ack));
    }

    /// The event loop wrote a publish with `pkid`
    pub fn written(&mut self, pkid: u16) {
        if pkid != 0 && self.in_flight.contains_key(&pkid) {
            trace!("Retransmission of packet {}", pkid);
            return;
        }
        match self.queued.pop_front() {
            Some((Qos::AtMostOnce, ack)) => ack.acknowledge(),
            Some((_, ack)) => {
                self.in_flight.insert(pkid, ack);
            }
            None => debug!("Outgoing publish {} without a queued ack", pkid),
        }
    }

    /// PUBACK or PUBCOMP arrived for `pkid`
    pub fn acknowledged(&mut self, pkid: u16) {
        match self.in_flight.remove(&pkid) {
            Some(ack) => ack.acknowledge(),
            None => debug!("Acknowledgment for unknown packet {}", pkid),
        }
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    /// Releases every waiter with `ConnectionClosed`
    pub fn fail_all(&mut self) {
        let released = self.pending();
        for (_, ack) in self.queued.drain(..) {
            ack.fail(SessionError::ConnectionClosed);
        }
        for (_, ack) in self.in_flight.drain() {
            ack.fail(SessionError::ConnectionClosed);
        }
        if released > 0 {
            debug!("Released {} pending acknowledgments", released);
        }
    }
}
