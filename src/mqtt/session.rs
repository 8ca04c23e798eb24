//! Session - connection lifecycle state machine and inbound dispatch
//!
//! ```text
//! Uninitialized ──► Connecting ──► Connected ◄──► Reconnecting
//!       ▲                               │
//!       └──────────── Ending ◄──────────┘   (disconnect_and_end / configure)
//!
//! any state ──► Failed  (unrecoverable transport error, left via configure)
//! ```
//!
//! Callers hold a cloneable [`Session`] handle; the transport itself never
//! leaves the session. Inbound traffic from every transport the session opens
//! is serialized through one dispatcher task, which delivers to the topic
//! listeners first and then updates the last-known-payload cache.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::config::{validate_filter, validate_topic, BrokerConfig, Qos};
use super::error::SessionError;
use super::message_manager::MqttMessage;
use super::transport::{Connector, EventSink, PublishAck, Transport, TransportEvent};
use super::{lock, read, write};

const CONNECTIVITY_CAPACITY: usize = 64;
const MAX_ERROR_MESSAGES: usize = 16;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Connecting,
    Connected,
    Reconnecting,
    Ending,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Ending => "ending",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One transition of the session state, as seen on the connectivity channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub state: ConnectionState,
    /// Connection generation the transition belongs to
    pub generation: u64,
    pub reason: Option<String>,
    pub at: DateTime<Local>,
}

/// Snapshot for status indicators
#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub broker: Option<String>,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

pub type MessageStream = mpsc::UnboundedReceiver<MqttMessage>;

struct ActiveLink {
    config: BrokerConfig,
    transport: Box<dyn Transport>,
}

#[derive(Default)]
struct Core {
    state: ConnectionState,
    generation: u64,
    link: Option<ActiveLink>,
    subscriptions: HashSet<String>,
    status: SessionStatus,
}

impl Core {
    fn record_error(&mut self, message: String) {
        if self.status.error_messages.len() == MAX_ERROR_MESSAGES {
            self.status.error_messages.remove(0);
        }
        self.status.error_messages.push(message);
    }

    fn connected_link(&self) -> Result<&ActiveLink, SessionError> {
        match (&self.state, &self.link) {
            (ConnectionState::Connected, Some(link)) => Ok(link),
            (state, _) => Err(SessionError::NotConnected(*state)),
        }
    }
}

struct Listener {
    filter: String,
    tx: mpsc::UnboundedSender<MqttMessage>,
}

/// Topic listeners plus the last payload seen per topic.
///
/// Only the dispatcher writes the cache.
#[derive(Default)]
struct Router {
    listeners: Mutex<Vec<Listener>>,
    last_values: RwLock<HashMap<String, Vec<u8>>>,
}

impl Router {
    fn register(&self, filter: &str) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners).push(Listener {
            filter: filter.to_string(),
            tx,
        });
        rx
    }

    fn deliver(&self, message: MqttMessage) {
        let mut delivered = 0;
        lock(&self.listeners).retain(|listener| {
            if !rumqttc::matches(message.topic(), &listener.filter) {
                return true;
            }
            match listener.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!("Dropping closed listener for {}", listener.filter);
                    false
                }
            }
        });

        if delivered == 0 {
            debug!("No listener for message on {}", message.topic());
        }

        write(&self.last_values).insert(message.topic().to_string(), message.payload().to_vec());
    }

    fn last_value(&self, topic: &str) -> Option<Vec<u8>> {
        read(&self.last_values).get(topic).cloned()
    }
}

struct Shared {
    core: Mutex<Core>,
    router: Router,
    connectivity: broadcast::Sender<ConnectivityEvent>,
}

impl Shared {
    /// Moves to `state` and tells connectivity listeners. Called with the core
    /// lock held so listeners observe transitions in order.
    fn transition(&self, core: &mut Core, state: ConnectionState, reason: Option<String>) {
        if core.state == state {
            return;
        }
        debug!("Session {} -> {}", core.state, state);
        core.state = state;
        core.status.connection_state = state;

        let event = ConnectivityEvent {
            state,
            generation: core.generation,
            reason,
            at: Local::now(),
        };
        // no receivers is fine
        let _ = self.connectivity.send(event);
    }

    fn handle_event(&self, generation: u64, event: TransportEvent) {
        let mut core = lock(&self.core);
        if generation != core.generation {
            debug!(
                "Discarding {:?} from stale connection {} (current {})",
                event, generation, core.generation
            );
            return;
        }

        match event {
            TransportEvent::Connected => {
                // the broker side is fresh, listeners must re-subscribe
                core.subscriptions.clear();
                info!("Connected (connection {})", generation);
                self.transition(&mut core, ConnectionState::Connected, None);
            }
            TransportEvent::Reconnecting { reason } => {
                core.record_error(reason.clone());
                let state = core.state;
                match state {
                    ConnectionState::Connecting | ConnectionState::Connected => {
                        warn!("Connection {} reconnecting: {}", generation, reason);
                        self.transition(&mut core, ConnectionState::Reconnecting, Some(reason));
                    }
                    _ => debug!("Still reconnecting: {}", reason),
                }
            }
            TransportEvent::Message(message) => {
                core.status.messages_received += 1;
                core.status.last_activity = Some(message.received_at());
                self.router.deliver(message);
            }
            TransportEvent::Failed { reason } => {
                error!("Connection {} failed: {}", generation, reason);
                core.record_error(reason.clone());
                core.subscriptions.clear();
                self.transition(&mut core, ConnectionState::Failed, Some(reason));
                if let Some(link) = core.link.take() {
                    tokio::spawn(link.transport.close());
                }
            }
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
    while let Some((generation, event)) = events.recv().await {
        shared.handle_event(generation, event);
    }
    debug!("Session dispatcher stopped");
}

struct Inner {
    shared: Arc<Shared>,
    connector: Box<dyn Connector>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    // serializes connect / configure / disconnect_and_end
    lifecycle: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // dropping the transport cancels it; the dispatcher ends with the last sink
        let link = lock(&self.shared.core).link.take();
        drop(link);
    }
}

/// Handle to the messaging session. Cheap to clone, all clones share one
/// connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Creates an idle session and spawns its dispatcher.
    /// Must be called inside a tokio runtime.
    pub fn new(connector: impl Connector) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connectivity, _) = broadcast::channel(CONNECTIVITY_CAPACITY);

        let shared = Arc::new(Shared {
            core: Mutex::new(Core::default()),
            router: Router::default(),
            connectivity,
        });
        tokio::spawn(dispatch(shared.clone(), events_rx));

        Session {
            inner: Arc::new(Inner {
                shared,
                connector: Box::new(connector),
                events_tx,
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Opens a connection to `config`. Only valid while uninitialized; the
    /// outcome arrives later on the connectivity channel.
    pub async fn connect(&self, config: BrokerConfig) -> Result<(), SessionError> {
        let config = config.validate()?;
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.open(config)
    }

    /// Forcibly closes the current connection and returns to uninitialized.
    /// Pending publish acknowledgments resolve with `ConnectionClosed`.
    pub async fn disconnect_and_end(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.end().await;
    }

    /// Replaces the connection with one to `config`.
    ///
    /// Returns once the old transport is fully closed and the new one is
    /// dialing. Subscriptions do not carry over.
    pub async fn configure(&self, config: BrokerConfig) -> Result<(), SessionError> {
        let config = config.validate()?;
        let _lifecycle = self.inner.lifecycle.lock().await;
        info!("Reconfiguring session for {}", config);
        self.end().await;
        self.open(config)
    }

    fn open(&self, config: BrokerConfig) -> Result<(), SessionError> {
        let shared = &self.inner.shared;
        let mut core = lock(&shared.core);
        if core.state != ConnectionState::Uninitialized {
            return Err(SessionError::InvalidState {
                operation: "connect",
                state: core.state,
            });
        }

        core.generation += 1;
        let sink = EventSink::new(core.generation, self.inner.events_tx.clone());
        core.status.broker = Some(config.to_string());

        match self.inner.connector.open(&config, sink) {
            Ok(transport) => {
                core.link = Some(ActiveLink { config, transport });
                shared.transition(&mut core, ConnectionState::Connecting, None);
                Ok(())
            }
            Err(e) => {
                error!("Could not open connection to {}: {}", config, e);
                core.record_error(e.to_string());
                shared.transition(&mut core, ConnectionState::Failed, Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    async fn end(&self) {
        let shared = &self.inner.shared;
        let link = {
            let mut core = lock(&shared.core);
            if core.state == ConnectionState::Uninitialized && core.link.is_none() {
                return;
            }
            // everything still queued from the old connection is now stale
            core.generation += 1;
            core.subscriptions.clear();
            shared.transition(&mut core, ConnectionState::Ending, None);
            core.link.take()
        };

        if let Some(link) = link {
            info!("Closing connection to {}", link.config);
            link.transport.close().await;
        }

        let mut core = lock(&shared.core);
        shared.transition(&mut core, ConnectionState::Uninitialized, None);
    }

    /// Queues `payload` on `topic`. Fails immediately unless connected.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: Qos,
    ) -> Result<PublishAck, SessionError> {
        validate_topic(topic)?;
        let mut core = lock(&self.inner.shared.core);

        let (ack_tx, ack) = PublishAck::pair();
        core.connected_link()?
            .transport
            .publish(topic, payload.into(), qos, ack_tx)?;

        core.status.messages_sent += 1;
        core.status.last_activity = Some(Local::now());
        Ok(ack)
    }

    /// Subscribes `filter` on the live connection. Repeating a subscription
    /// is a no-op until the next (re)connect.
    pub fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), SessionError> {
        validate_filter(filter)?;
        let mut core = lock(&self.inner.shared.core);
        let link = core.connected_link()?;

        if core.subscriptions.contains(filter) {
            debug!("Already subscribed to {}", filter);
            return Ok(());
        }
        link.transport.subscribe(filter, qos)?;
        info!("Subscribed to {} ({:?})", filter, qos);
        core.subscriptions.insert(filter.to_string());
        Ok(())
    }

    /// Drops a subscription. Without a live connection there is nothing to
    /// unsubscribe from and this does nothing.
    pub fn unsubscribe(&self, filter: &str) -> Result<(), SessionError> {
        let mut core = lock(&self.inner.shared.core);
        let was_subscribed = core.subscriptions.remove(filter);

        let link = match core.connected_link() {
            Ok(link) => link,
            Err(_) => {
                debug!("Unsubscribe from {} while {}, nothing to do", filter, core.state);
                return Ok(());
            }
        };
        if !was_subscribed {
            return Ok(());
        }

        let result = link.transport.unsubscribe(filter);
        if let Err(e) = result {
            core.subscriptions.insert(filter.to_string());
            return Err(e.into());
        }
        info!("Unsubscribed from {}", filter);
        Ok(())
    }

    /// Registers a listener for every inbound message matching `filter`
    /// (MQTT wildcards allowed). Survives reconnects and reconfiguration.
    pub fn on_message(&self, filter: &str) -> Result<MessageStream, SessionError> {
        validate_filter(filter)?;
        Ok(self.inner.shared.router.register(filter))
    }

    pub fn on_connectivity_change(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.shared.connectivity.subscribe()
    }

    /// Last payload received on `topic`, if any
    pub fn last_value(&self, topic: &str) -> Option<Vec<u8>> {
        self.inner.shared.router.last_value(topic)
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared.core).state
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.inner.shared.core).status.clone()
    }

    pub fn active_config(&self) -> Option<BrokerConfig> {
        lock(&self.inner.shared.core)
            .link
            .as_ref()
            .map(|link| link.config.clone())
    }

    pub fn is_subscribed(&self, filter: &str) -> bool {
        lock(&self.inner.shared.core).subscriptions.contains(filter)
    }
}
