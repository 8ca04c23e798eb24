use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use wagner_remote::mqtt::loopback::LoopbackNetwork;
use wagner_remote::mqtt::{
    BrokerConfig, ConnectionState, ConnectivityEvent, MessageStream, MqttMessage, Session,
};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn broker(host: &str) -> BrokerConfig {
    BrokerConfig::from_url(&format!("mqtt://{}:1883", host)).expect("valid broker url")
}

/// Waits for the next transition into `state`, skipping others
pub async fn wait_for(
    rx: &mut broadcast::Receiver<ConnectivityEvent>,
    state: ConnectionState,
) -> ConnectivityEvent {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for connectivity")
            .expect("connectivity channel closed");
        if event.state == state {
            return event;
        }
    }
}

pub async fn next_message(stream: &mut MessageStream) -> MqttMessage {
    timeout(WAIT, stream.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("listener closed")
}

/// Lets the dispatcher drain whatever is queued
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Session connected to the loopback broker `host`
pub async fn connected_session(
    network: &LoopbackNetwork,
    host: &str,
) -> (Session, broadcast::Receiver<ConnectivityEvent>) {
    let session = Session::new(network.connector());
    let mut connectivity = session.on_connectivity_change();
    session.connect(broker(host)).await.expect("connect accepted");
    wait_for(&mut connectivity, ConnectionState::Connected).await;
    (session, connectivity)
}
