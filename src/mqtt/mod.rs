//! # MQTT Session Module
//!
//! Owns the single broker connection of the remote and everything that flows
//! through it: joypad commands and speed set-points going out, speed telemetry
//! coming back in.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - BrokerConfig, QoS, last will, url parsing
//! ├── error.rs            - TransportError and SessionError
//! ├── message_manager.rs  - Inbound message representation
//! ├── transport.rs        - Transport/Connector capability, ack bookkeeping
//! ├── rumqtt.rs           - rumqttc transport with its connection driver
//! ├── loopback.rs         - In-process brokers for tests and offline runs
//! └── session.rs          - Connection state machine and inbound dispatch
//! ```
//!
//! ## Design Notes
//!
//! - **One dispatcher per session**: every transport the session ever opens
//!   feeds the same dispatcher task. Listener registration is independent of
//!   the transport, so a reconnect or a broker switch never duplicates
//!   listeners.
//! - **Generations**: each opened transport gets a new generation number.
//!   Events from an older generation are discarded, which is what keeps a
//!   replaced broker from leaking messages into the new session.
//! - **Acks are not messages**: publish acknowledgments resolve a per-publish
//!   [`transport::PublishAck`]. They never pass through inbound dispatch.

pub mod config;
pub mod error;
pub mod loopback;
pub mod message_manager;
pub mod rumqtt;
pub mod session;
pub mod transport;

pub use config::{BrokerConfig, ConfigError, Protocol, Qos};
pub use error::{SessionError, TransportError};
pub use message_manager::MqttMessage;
pub use session::{ConnectionState, ConnectivityEvent, MessageStream, Session, SessionStatus};
pub use transport::PublishAck;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panicking listener must not take the whole session down with a poisoned lock
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
