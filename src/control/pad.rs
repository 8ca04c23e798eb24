use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, Gesture};
use crate::mqtt::config::validate_topic;
use crate::mqtt::{MessageStream, MqttMessage, PublishAck, Qos, Session, SessionError};
use crate::persistence::DeviceProfile;

/// Commands and set-points are sent at least once
const COMMAND_QOS: Qos = Qos::AtLeastOnce;

/// Outcome of one speed telemetry message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeedUpdate {
    /// The displayed speed moved to the reported value
    Changed(u8),
    /// Report matches what is already displayed, e.g. our own set-point echoed back
    Unchanged,
    /// Payload could not be decoded, the displayed speed was kept
    Rejected(CodecError),
}

/// Joypad plus speed slider, driving one session.
///
/// The speed topic carries both the set-points sent from here and the speed
/// the car reports. Telemetry only moves the displayed value when it differs
/// from it and never causes a publish, so our own echo dies here.
pub struct ControlPad {
    session: Session,
    control_topic: String,
    speed_topic: String,
    speed_feed: MessageStream,
    displayed_speed: u8,
}

impl ControlPad {
    pub fn new(session: Session, profile: &DeviceProfile) -> Result<Self, SessionError> {
        let speed_feed = session.on_message(&profile.speed_topic)?;
        let displayed_speed = initial_speed(&session, &profile.speed_topic);

        Ok(ControlPad {
            session,
            control_topic: profile.control_topic.clone(),
            speed_topic: profile.speed_topic.clone(),
            speed_feed,
            displayed_speed,
        })
    }

    /// Subscribes the speed topic. Call after every Connected event, the
    /// subscription does not survive a reconnect.
    pub fn on_connected(&self) -> Result<(), SessionError> {
        self.session.subscribe(&self.speed_topic, COMMAND_QOS)
    }

    pub fn press(&self, gesture: Gesture) -> Result<PublishAck, SessionError> {
        let code = codec::encode(gesture);
        debug!("{} -> {} on {}", gesture, code, self.control_topic);
        self.session
            .publish(&self.control_topic, code.to_bytes(), COMMAND_QOS)
    }

    /// Moves the slider to `value` and sends the set-point. The displayed
    /// speed only changes once the publish was accepted.
    pub fn set_speed(&mut self, value: f64) -> Result<PublishAck, SessionError> {
        let speed = codec::normalize_speed(value);
        let ack = self.session.publish(
            &self.speed_topic,
            codec::encode_speed(f64::from(speed)),
            COMMAND_QOS,
        )?;
        info!("Speed set to {}", speed);
        self.displayed_speed = speed;
        Ok(ack)
    }

    pub fn apply_telemetry(&mut self, message: &MqttMessage) -> SpeedUpdate {
        if message.topic() != self.speed_topic {
            debug!("Ignoring telemetry for {}", message.topic());
            return SpeedUpdate::Unchanged;
        }

        match codec::decode_speed(message.payload()) {
            Ok(speed) if speed == self.displayed_speed => SpeedUpdate::Unchanged,
            Ok(speed) => {
                debug!("Reported speed {} (was {})", speed, self.displayed_speed);
                self.displayed_speed = speed;
                SpeedUpdate::Changed(speed)
            }
            Err(e) => {
                warn!(
                    "Discarding speed telemetry on {}: {}. Keeping {}",
                    message.topic(),
                    e,
                    self.displayed_speed
                );
                SpeedUpdate::Rejected(e)
            }
        }
    }

    /// Next message on the speed topic. `None` once the session is gone.
    pub async fn next_telemetry(&mut self) -> Option<MqttMessage> {
        self.speed_feed.recv().await
    }

    /// Switches to new topic names. The speed listener moves along; if the
    /// session is connected the new speed topic is subscribed right away.
    /// On error both topics stay as they were.
    pub fn retarget(&mut self, control_topic: &str, speed_topic: &str) -> Result<(), SessionError> {
        validate_topic(control_topic)?;
        validate_topic(speed_topic)?;

        if speed_topic == self.speed_topic {
            self.control_topic = control_topic.to_string();
            return Ok(());
        }

        self.session.unsubscribe(&self.speed_topic)?;
        let speed_feed = self.session.on_message(speed_topic)?;

        self.control_topic = control_topic.to_string();
        self.speed_topic = speed_topic.to_string();
        self.speed_feed = speed_feed;
        info!("Speed topic is now {}", self.speed_topic);

        match self.on_connected() {
            Ok(()) | Err(SessionError::NotConnected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn displayed_speed(&self) -> u8 {
        self.displayed_speed
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    pub fn speed_topic(&self) -> &str {
        &self.speed_topic
    }
}

fn initial_speed(session: &Session, speed_topic: &str) -> u8 {
    session
        .last_value(speed_topic)
        .and_then(|payload| codec::decode_speed(&payload).ok())
        .unwrap_or(0)
}
