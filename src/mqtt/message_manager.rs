use chrono::{DateTime, Local};
use std::fmt;

/// Inbound publish as handed to topic listeners
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MqttMessage {
    topic: String,
    payload: Vec<u8>,
    received_at: DateTime<Local>,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.payload_str();
        let preview: String = text.chars().take(32).collect();
        write!(
            f,
            "{} - {}: {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview
        )
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }
}
