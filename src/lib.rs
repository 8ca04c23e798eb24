//! Remote control for the Wagner car over MQTT.
//!
//! The library holds everything but the terminal: the command codec, the
//! messaging session, the persisted device profile and the headless control
//! pad. The `wagner-remote` binary wires them together.

pub mod codec;
pub mod control;
pub mod mqtt;
pub mod persistence;
