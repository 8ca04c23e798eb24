//! # Persistence Module
//!
//! Holds the device profile: the button layout preference, the two topic
//! names and an optional broker override. The profile is loaded once before
//! the session exists and rewritten after every settings change.
//!
//! ## Error Handling Strategy
//! Loading never fails. A missing profile means first run and yields the
//! defaults; an unreadable or corrupt one is logged and also yields the
//! defaults, so the remote always starts. Fields that parse but would be
//! rejected as an edit (an empty topic, a wildcard topic, a broker without a
//! host) fall back to their own default. Saving reports every failure to the
//! caller.

pub mod profile_store;

pub use profile_store::ProfileStore;

use crate::mqtt::config::{validate_topic, BrokerConfig, ConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONTROL_TOPIC: &str = "Sistemas.Embarcados.Wagner.Actions.Control";
pub const DEFAULT_SPEED_TOPIC: &str = "Sistemas.Embarcados.Wagner.Actions.Speed";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Profile I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize profile: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Settings of one remote, as edited on the settings screen.
///
/// Missing keys in a stored profile fall back to their defaults, so older
/// profile files keep loading.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceProfile {
    /// Alternative joypad layout
    pub buttons_option: bool,
    /// Topic carrying command codes to the car
    pub control_topic: String,
    /// Topic carrying speed set-points and telemetry
    pub speed_topic: String,
    /// Broker override. `None` uses the stock broker.
    pub broker: Option<BrokerConfig>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            buttons_option: false,
            control_topic: DEFAULT_CONTROL_TOPIC.to_string(),
            speed_topic: DEFAULT_SPEED_TOPIC.to_string(),
            broker: None,
        }
    }
}

impl DeviceProfile {
    /// Broker the session should connect to
    pub fn broker_config(&self) -> BrokerConfig {
        self.broker.clone().unwrap_or_default()
    }
}

/// One user edit of the profile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProfileChange {
    ButtonsOption(bool),
    ControlTopic(String),
    SpeedTopic(String),
    Broker(Option<BrokerConfig>),
}

impl ProfileChange {
    /// Applies the edit to `profile` after checking it
    pub(crate) fn apply_to(self, profile: &mut DeviceProfile) -> Result<(), ConfigError> {
        match self {
            ProfileChange::ButtonsOption(enabled) => profile.buttons_option = enabled,
            ProfileChange::ControlTopic(topic) => {
                let topic = topic.trim().to_string();
                validate_topic(&topic)?;
                profile.control_topic = topic;
            }
            ProfileChange::SpeedTopic(topic) => {
                let topic = topic.trim().to_string();
                validate_topic(&topic)?;
                profile.speed_topic = topic;
            }
            ProfileChange::Broker(broker) => {
                profile.broker = broker.map(BrokerConfig::validate).transpose()?;
            }
        }
        Ok(())
    }

    /// Whether the edit requires a new broker connection
    pub fn changes_broker(&self) -> bool {
        matches!(self, ProfileChange::Broker(_))
    }
}
