use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BROKER_URL: &str = "ws://broker.hivemq.com:8000/mqtt";
pub const DEFAULT_WEBSOCKET_PATH: &str = "/mqtt";
const CLIENT_ID_PREFIX: &str = "Wagner-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid broker url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Broker host must not be empty")]
    EmptyHost,

    #[error("Invalid topic {0:?}")]
    InvalidTopic(String),

    #[error("Invalid last will: {0}")]
    InvalidLastWill(String),
}

/// Delivery guarantee of a publish or subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for Qos {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => Qos::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => Qos::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

/// Byte stream carrying the MQTT packets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Mqtts,
    #[default]
    Ws,
    Wss,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Result<Self, ConfigError> {
        match scheme {
            "mqtt" | "tcp" => Ok(Protocol::Mqtt),
            "mqtts" | "ssl" | "tls" => Ok(Protocol::Mqtts),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Mqtts => "mqtts",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Mqtt => 1883,
            Protocol::Mqtts => 8883,
            Protocol::Ws => 80,
            Protocol::Wss => 443,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }
}

/// Message the broker publishes on our behalf after an unclean disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
    pub retain: bool,
}

impl Default for LastWill {
    fn default() -> Self {
        Self {
            topic: "WillMsg".to_string(),
            payload: "Connection Closed abnormally..!".to_string(),
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection options for one broker.
///
/// A session never mutates the config it was connected with. Changing any
/// field means building a new `BrokerConfig` and handing it to
/// `Session::configure`, which replaces the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Only used by websocket protocols
    #[serde(default = "default_path")]
    pub path: String,
    pub client_id: String,
    pub keepalive_secs: u16,
    pub clean_session: bool,
    /// Delay between redial attempts; 0 disables reconnecting
    pub reconnect_period_ms: u64,
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub last_will: Option<LastWill>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_path() -> String {
    DEFAULT_WEBSOCKET_PATH.to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 8000,
            protocol: Protocol::Ws,
            path: default_path(),
            client_id: generate_client_id(),
            keepalive_secs: 60,
            clean_session: true,
            reconnect_period_ms: 1000,
            connect_timeout_ms: 30 * 1000,
            last_will: Some(LastWill::default()),
            credentials: None,
        }
    }
}

impl BrokerConfig {
    /// Builds a config from a broker url such as `ws://broker.hivemq.com:8000/mqtt`.
    /// Timing and session options keep their defaults.
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        let protocol = Protocol::from_scheme(parsed.scheme())?;
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(ConfigError::EmptyHost)?
            .to_string();
        let port = parsed.port().unwrap_or_else(|| protocol.default_port());
        let path = match parsed.path() {
            "" | "/" => default_path(),
            path => path.to_string(),
        };

        let credentials = match (parsed.username(), parsed.password()) {
            ("", None) => None,
            (username, password) => Some(Credentials {
                username: username.to_string(),
                password: password.unwrap_or_default().to_string(),
            }),
        };

        Ok(Self {
            host,
            port,
            protocol,
            path,
            credentials,
            ..Self::default()
        })
    }

    /// Address as understood by the transport: `host` for raw sockets,
    /// a full url for websockets.
    pub fn broker_address(&self) -> String {
        if self.protocol.is_websocket() {
            format!(
                "{}://{}:{}{}",
                self.protocol.scheme(),
                self.host,
                self.port,
                self.path
            )
        } else {
            self.host.clone()
        }
    }

    /// Rejects options the transport cannot honour and fills in a client id
    /// when none was given.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        self.client_id = self.client_id.trim().to_string();
        if self.client_id.is_empty() {
            self.client_id = generate_client_id();
        }
        if let Some(will) = &self.last_will {
            if validate_topic(&will.topic).is_err() {
                return Err(ConfigError::InvalidLastWill(format!(
                    "topic {:?} is not publishable",
                    will.topic
                )));
            }
        }
        Ok(self)
    }
}

impl fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.credentials {
            Some(credentials) => write!(
                f,
                "{}@{}://{}:{}",
                credentials.username,
                self.protocol.scheme(),
                self.host,
                self.port
            ),
            None => write!(f, "{}://{}:{}", self.protocol.scheme(), self.host, self.port),
        }
    }
}

/// `Wagner-<n>` with n in 0..100, derived from the clock
pub fn generate_client_id() -> String {
    let nanos = chrono::Local::now().timestamp_subsec_nanos();
    format!("{}{}", CLIENT_ID_PREFIX, (nanos ^ (nanos >> 16)) % 100)
}

/// Topic names we publish to must be concrete, filters may use wildcards
pub fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    if !topic.is_empty() && rumqttc::valid_topic(topic) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTopic(topic.to_string()))
    }
}

pub fn validate_filter(filter: &str) -> Result<(), ConfigError> {
    if !filter.is_empty() && rumqttc::valid_filter(filter) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTopic(filter.to_string()))
    }
}
