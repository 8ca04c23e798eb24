//! Control pad driving a session, with the loopback broker playing the car

use tokio::sync::mpsc::error::TryRecvError;
use wagner_remote::codec::Gesture;
use wagner_remote::control::{ControlPad, SpeedUpdate};
use wagner_remote::mqtt::loopback::LoopbackNetwork;
use wagner_remote::mqtt::{ConnectionState, Qos};
use wagner_remote::persistence::DeviceProfile;

use crate::support::{connected_session, next_message, settle, wait_for};

fn profile() -> DeviceProfile {
    DeviceProfile {
        control_topic: "car/control".to_string(),
        speed_topic: "car/speed".to_string(),
        ..DeviceProfile::default()
    }
}

#[tokio::test]
async fn test_speed_echo_does_not_amplify() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;
    let mut pad = ControlPad::new(session, &profile()).unwrap();
    pad.on_connected().unwrap();

    pad.set_speed(42.0).unwrap().wait().await.unwrap();
    assert_eq!(pad.displayed_speed(), 42);

    // the broker echoes our own set-point back on the speed topic
    let echo = tokio::time::timeout(crate::support::WAIT, pad.next_telemetry())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echo.payload(), b"42");
    assert_eq!(pad.apply_telemetry(&echo), SpeedUpdate::Unchanged);
    assert_eq!(pad.displayed_speed(), 42);

    settle().await;
    let alpha = network.broker("alpha");
    assert_eq!(alpha.published_on("car/speed"), vec![b"42".to_vec()]);
}

#[tokio::test]
async fn test_malformed_telemetry_keeps_displayed_speed() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;
    let mut pad = ControlPad::new(session, &profile()).unwrap();
    pad.on_connected().unwrap();

    let alpha = network.broker("alpha");
    alpha.inject("car/speed", "30");
    let report = pad.next_telemetry().await.unwrap();
    assert_eq!(pad.apply_telemetry(&report), SpeedUpdate::Changed(30));

    alpha.inject("car/speed", "abc");
    let garbage = pad.next_telemetry().await.unwrap();
    assert!(matches!(
        pad.apply_telemetry(&garbage),
        SpeedUpdate::Rejected(_)
    ));
    assert_eq!(pad.displayed_speed(), 30);
    assert!(alpha.published().is_empty());
}

#[tokio::test]
async fn test_pad_starts_from_last_known_speed() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;
    let mut watcher = session.on_message("car/speed").unwrap();
    session.subscribe("car/speed", Qos::AtLeastOnce).unwrap();

    network.broker("alpha").inject("car/speed", "77");
    next_message(&mut watcher).await;

    let pad = ControlPad::new(session, &profile()).unwrap();
    assert_eq!(pad.displayed_speed(), 77);
}

#[tokio::test]
async fn test_pad_resubscribes_after_reconnect() {
    let network = LoopbackNetwork::new();
    let (session, mut connectivity) = connected_session(&network, "alpha").await;
    let mut pad = ControlPad::new(session.clone(), &profile()).unwrap();
    pad.on_connected().unwrap();

    let alpha = network.broker("alpha");
    alpha.bounce_connections();
    wait_for(&mut connectivity, ConnectionState::Connected).await;
    assert_eq!(alpha.subscriber_count("car/speed"), 0);

    pad.on_connected().unwrap();
    assert_eq!(alpha.subscriber_count("car/speed"), 1);
    alpha.inject("car/speed", "5");
    let report = pad.next_telemetry().await.unwrap();
    assert_eq!(pad.apply_telemetry(&report), SpeedUpdate::Changed(5));
}

#[tokio::test]
async fn test_joypad_codes_reach_the_car() {
    let network = LoopbackNetwork::new();
    let (session, _connectivity) = connected_session(&network, "alpha").await;
    let mut car = session.on_message("car/control").unwrap();
    let pad = ControlPad::new(session.clone(), &profile()).unwrap();

    for gesture in Gesture::ALL {
        pad.press(gesture).unwrap();
    }

    let sent: Vec<String> = network
        .broker("alpha")
        .published_on("car/control")
        .into_iter()
        .map(|payload| String::from_utf8(payload).unwrap())
        .collect();
    assert_eq!(
        sent,
        vec![
            "<19#210>", "<19#204>", "<19#212>", "<20#206>", "<20#202>", "<20#208>", "<21#210>",
            "<21#204>", "<21#212>",
        ]
    );

    // nobody subscribed the control topic, so nothing comes back
    settle().await;
    assert_eq!(car.try_recv(), Err(TryRecvError::Empty));
}
