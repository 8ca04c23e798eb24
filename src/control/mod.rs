//! Headless control surface
//!
//! 1. [`pad`] - joypad and speed slider logic of the home screen
//! 2. [`console`] - line-oriented operator commands for the terminal binary
//!
//! ```text
//! operator ──► ConsoleCommand ──► ControlPad ──► Session.publish
//!                                     ▲
//!              speed telemetry ───────┘ (deduplicated against the slider)
//! ```

pub mod console;
pub mod pad;

pub use console::ConsoleCommand;
pub use pad::{ControlPad, SpeedUpdate};
