//! Session lifecycle against loopback brokers

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TryRecvError;
use wagner_remote::mqtt::loopback::LoopbackNetwork;
use wagner_remote::mqtt::transport::{
    AckSender, CloseFuture, Connector, EventSink, Transport, TransportEvent,
};
use wagner_remote::mqtt::{
    BrokerConfig, ConnectionState, Qos, Session, SessionError, TransportError,
};

use crate::support::{broker, connected_session, next_message, settle, wait_for};

#[tokio::test]
async fn test_configure_drops_traffic_from_previous_broker() {
    let network = LoopbackNetwork::new();
    let (session, mut connectivity) = connected_session(&network, "alpha").await;
    let mut speed = session.on_message("car/speed").unwrap();
    session.subscribe("car/speed", Qos::AtLeastOnce).unwrap();

    // queued by the old broker but not yet dispatched when configure starts
    let alpha = network.broker("alpha");
    assert_eq!(alpha.inject("car/speed", "7"), 1);

    session.configure(broker("beta")).await.unwrap();
    assert_eq!(alpha.client_count(), 0);

    let connected = wait_for(&mut connectivity, ConnectionState::Connected).await;
    settle().await;
    assert_eq!(speed.try_recv(), Err(TryRecvError::Empty));
    assert!(session.last_value("car/speed").is_none());

    // exactly one Connected for the new connection
    let mut extra_connected = 0;
    while let Ok(event) = connectivity.try_recv() {
        if event.state == ConnectionState::Connected && event.generation == connected.generation
        {
            extra_connected += 1;
        }
    }
    assert_eq!(extra_connected, 0);

    // subscriptions did not carry over, the new broker works once re-subscribed
    assert!(!session.is_subscribed("car/speed"));
    session.subscribe("car/speed", Qos::AtLeastOnce).unwrap();
    network.broker("beta").inject("car/speed", "9");
    assert_eq!(next_message(&mut speed).await.payload(), b"9");
    assert_eq!(session.last_value("car/speed"), Some(b"9".to_vec()));
}

#[tokio::test]
async fn test_subscribe_twice_delivers_once() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;
    let mut speed = session.on_message("car/speed").unwrap();

    session.subscribe("car/speed", Qos::AtLeastOnce).unwrap();
    session.subscribe("car/speed", Qos::AtLeastOnce).unwrap();
    assert_eq!(network.broker("alpha").subscriber_count("car/speed"), 1);

    network.broker("alpha").inject("car/speed", "15");
    assert_eq!(next_message(&mut speed).await.payload(), b"15");
    settle().await;
    assert_eq!(speed.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_publish_before_connect_is_never_sent() {
    let network = LoopbackNetwork::new();
    let session = Session::new(network.connector());
    let mut connectivity = session.on_connectivity_change();

    let result = session.publish("car/control", "<20#202>", Qos::AtLeastOnce);
    assert!(matches!(
        result,
        Err(SessionError::NotConnected(ConnectionState::Uninitialized))
    ));

    session.connect(broker("alpha")).await.unwrap();
    wait_for(&mut connectivity, ConnectionState::Connected).await;
    settle().await;
    assert!(network.broker("alpha").published().is_empty());
}

#[tokio::test]
async fn test_publish_ack_is_not_a_message() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;
    let mut everything = session.on_message("#").unwrap();

    let ack = session
        .publish("car/control", "<19#204>", Qos::AtLeastOnce)
        .unwrap();
    assert!(ack.wait().await.is_ok());

    settle().await;
    assert_eq!(everything.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(session.status().messages_sent, 1);
    assert_eq!(session.status().messages_received, 0);
}

#[tokio::test]
async fn test_wildcard_listener_sees_matching_topics() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;
    let mut car = session.on_message("car/+").unwrap();
    session.subscribe("car/#", Qos::AtMostOnce).unwrap();

    let alpha = network.broker("alpha");
    alpha.inject("car/speed", "1");
    alpha.inject("car/lights/front", "on");
    alpha.inject("car/control", "<20#202>");

    assert_eq!(next_message(&mut car).await.topic(), "car/speed");
    assert_eq!(next_message(&mut car).await.topic(), "car/control");
    assert_eq!(
        session.last_value("car/lights/front"),
        Some(b"on".to_vec())
    );
}

#[tokio::test]
async fn test_reconnect_requires_resubscribe() {
    let network = LoopbackNetwork::new();
    let (session, mut connectivity) = connected_session(&network, "alpha").await;
    let mut speed = session.on_message("car/speed").unwrap();
    session.subscribe("car/speed", Qos::AtLeastOnce).unwrap();

    let alpha = network.broker("alpha");
    alpha.bounce_connections();

    let reconnecting = wait_for(&mut connectivity, ConnectionState::Reconnecting).await;
    assert!(reconnecting.reason.is_some());
    wait_for(&mut connectivity, ConnectionState::Connected).await;
    assert!(!session.is_subscribed("car/speed"));

    session.subscribe("car/speed", Qos::AtLeastOnce).unwrap();
    alpha.inject("car/speed", "64");
    assert_eq!(next_message(&mut speed).await.payload(), b"64");
    assert!(!session.status().error_messages.is_empty());
}

#[tokio::test]
async fn test_failed_connection_is_left_through_configure() {
    let network = LoopbackNetwork::new();
    let (session, mut connectivity) = connected_session(&network, "alpha").await;

    network.broker("alpha").fail_connections("broker shut down");
    let failed = wait_for(&mut connectivity, ConnectionState::Failed).await;
    assert_eq!(failed.reason.as_deref(), Some("broker shut down"));
    assert!(matches!(
        session.publish("car/speed", "1", Qos::AtLeastOnce),
        Err(SessionError::NotConnected(ConnectionState::Failed))
    ));
    assert!(matches!(
        session.connect(broker("alpha")).await,
        Err(SessionError::InvalidState { .. })
    ));

    session.configure(broker("beta")).await.unwrap();
    wait_for(&mut connectivity, ConnectionState::Connected).await;
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_refused_connection_fails() {
    let network = LoopbackNetwork::new();
    network.broker("alpha").refuse_connections(Some("not authorized"));
    let session = Session::new(network.connector());
    let mut connectivity = session.on_connectivity_change();

    session.connect(broker("alpha")).await.unwrap();
    let failed = wait_for(&mut connectivity, ConnectionState::Failed).await;
    assert!(failed.reason.unwrap().contains("not authorized"));
    assert_eq!(session.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_invalid_config_keeps_current_connection() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;

    let invalid = BrokerConfig {
        host: "  ".to_string(),
        ..broker("beta")
    };
    assert!(matches!(
        session.configure(invalid).await,
        Err(SessionError::Config(_))
    ));
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(network.broker("alpha").client_count(), 1);
}

/// Transport that accepts publishes but never hears back from the broker
struct SilentTransport {
    pending: Arc<Mutex<Vec<AckSender>>>,
}

impl Transport for SilentTransport {
    fn publish(
        &self,
        _topic: &str,
        _payload: Vec<u8>,
        _qos: Qos,
        ack: AckSender,
    ) -> Result<(), TransportError> {
        self.pending.lock().unwrap().push(ack);
        Ok(())
    }

    fn subscribe(&self, _filter: &str, _qos: Qos) -> Result<(), TransportError> {
        Ok(())
    }

    fn unsubscribe(&self, _filter: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(self: Box<Self>) -> CloseFuture {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        Box::pin(async move {
            for ack in pending {
                ack.fail(SessionError::ConnectionClosed);
            }
        })
    }
}

struct SilentConnector;

impl Connector for SilentConnector {
    fn open(
        &self,
        _config: &BrokerConfig,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        events.emit(TransportEvent::Connected);
        Ok(Box::new(SilentTransport {
            pending: Arc::default(),
        }))
    }
}

#[tokio::test]
async fn test_teardown_releases_pending_acks() {
    let session = Session::new(SilentConnector);
    let mut connectivity = session.on_connectivity_change();
    session.connect(broker("silent")).await.unwrap();
    wait_for(&mut connectivity, ConnectionState::Connected).await;

    let first = session.publish("car/speed", "10", Qos::AtLeastOnce).unwrap();
    let second = session
        .publish("car/control", "<20#202>", Qos::ExactlyOnce)
        .unwrap();

    session.disconnect_and_end().await;
    assert!(matches!(first.wait().await, Err(SessionError::ConnectionClosed)));
    assert!(matches!(second.wait().await, Err(SessionError::ConnectionClosed)));
    assert_eq!(session.state(), ConnectionState::Uninitialized);
}
