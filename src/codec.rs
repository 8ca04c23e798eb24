//! Command Codec - wire format shared with the vehicle firmware
//!
//! Joypad gestures travel as compact `<NN#MMM>` tokens on the control topic,
//! speed travels as a bare decimal integer (0-100) on the speed topic. The
//! gesture table is part of the firmware contract: the firmware splits the
//! token at `#`, uses the group to pick a row and `(code / 2) - 101` to pick
//! the action inside that row. Changing a code here breaks every deployed car.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound of the speed scale understood by the firmware
pub const MAX_SPEED: u8 = 100;

const START_MARKER: char = '<';
const END_MARKER: char = '>';
const DELIMITER: char = '#';

/// Errors raised while encoding or decoding wire payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Speed payload is not a decimal integer: {0:?}")]
    MalformedSpeed(String),

    #[error("Speed {0} is outside of 0..={MAX_SPEED}")]
    SpeedOutOfRange(i64),

    #[error("Malformed command code: {0:?}")]
    MalformedCommand(String),

    #[error("Unknown gesture: {0:?}")]
    UnknownGesture(String),
}

/// The nine joypad buttons, laid out as three rows of three
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gesture {
    UpLeft,
    Up,
    UpRight,
    Left,
    Stop,
    Right,
    DownLeft,
    Down,
    DownRight,
}

impl Gesture {
    pub const ALL: [Gesture; 9] = [
        Gesture::UpLeft,
        Gesture::Up,
        Gesture::UpRight,
        Gesture::Left,
        Gesture::Stop,
        Gesture::Right,
        Gesture::DownLeft,
        Gesture::Down,
        Gesture::DownRight,
    ];

    /// Firmware row and action code for this gesture
    const fn wire_parts(self) -> (u8, u16) {
        match self {
            Gesture::UpLeft => (19, 210),
            Gesture::Up => (19, 204),
            Gesture::UpRight => (19, 212),
            Gesture::Left => (20, 206),
            Gesture::Stop => (20, 202),
            Gesture::Right => (20, 208),
            Gesture::DownLeft => (21, 210),
            Gesture::Down => (21, 204),
            Gesture::DownRight => (21, 212),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Gesture::UpLeft => "up-left",
            Gesture::Up => "up",
            Gesture::UpRight => "up-right",
            Gesture::Left => "left",
            Gesture::Stop => "stop",
            Gesture::Right => "right",
            Gesture::DownLeft => "down-left",
            Gesture::Down => "down",
            Gesture::DownRight => "down-right",
        }
    }

    /// Reverse lookup of the static table
    pub fn from_code(code: &CommandCode) -> Option<Gesture> {
        Gesture::ALL
            .into_iter()
            .find(|gesture| gesture.wire_parts() == (code.group, code.code))
    }
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Gesture {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Gesture::ALL
            .into_iter()
            .find(|gesture| gesture.name() == wanted)
            .ok_or_else(|| CodecError::UnknownGesture(s.to_string()))
    }
}

/// A single `<Group#Code>` token as published on the control topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode {
    group: u8,
    code: u16,
}

impl CommandCode {
    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Parses a token of the exact shape `<NN#MMM>` (two digit group,
    /// one to three digit code).
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let malformed = || CodecError::MalformedCommand(raw.to_string());

        let body = raw
            .strip_prefix(START_MARKER)
            .and_then(|rest| rest.strip_suffix(END_MARKER))
            .ok_or_else(malformed)?;
        let (group, code) = body.split_once(DELIMITER).ok_or_else(malformed)?;

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if group.len() != 2 || !all_digits(group) {
            return Err(malformed());
        }
        if code.is_empty() || code.len() > 3 || !all_digits(code) {
            return Err(malformed());
        }

        Ok(CommandCode {
            group: group.parse().map_err(|_| malformed())?,
            code: code.parse().map_err(|_| malformed())?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{:02}{}{}{}",
            START_MARKER, self.group, DELIMITER, self.code, END_MARKER
        )
    }
}

impl FromStr for CommandCode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandCode::parse(s)
    }
}

/// Maps a joypad gesture to its wire token. Total over [`Gesture`].
pub fn encode(gesture: Gesture) -> CommandCode {
    let (group, code) = gesture.wire_parts();
    CommandCode { group, code }
}

/// Decodes a speed telemetry payload.
///
/// Surrounding ASCII whitespace is tolerated, anything else that is not a
/// base-10 integer in `0..=100` is rejected so the caller can keep its last
/// known value.
pub fn decode_speed(payload: &[u8]) -> Result<u8, CodecError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| CodecError::MalformedSpeed(String::from_utf8_lossy(payload).into_owned()))?;
    let trimmed = text.trim();

    let value: i64 = trimmed
        .parse()
        .map_err(|_| CodecError::MalformedSpeed(text.to_string()))?;

    if !(0..=i64::from(MAX_SPEED)).contains(&value) {
        return Err(CodecError::SpeedOutOfRange(value));
    }
    Ok(value as u8)
}

/// Clamps a slider value to the speed scale, flooring fractions.
/// NaN maps to zero.
pub fn normalize_speed(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.floor().clamp(0.0, f64::from(MAX_SPEED)) as u8
}

/// Renders a speed set-point as decimal ASCII without leading zeros
pub fn encode_speed(value: f64) -> Vec<u8> {
    normalize_speed(value).to_string().into_bytes()
}
