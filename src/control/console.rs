use std::str::FromStr;

use thiserror::Error;

use crate::codec::Gesture;
use crate::mqtt::config::{BrokerConfig, ConfigError};
use crate::persistence::ProfileChange;

pub const HELP: &str = "\
commands:
  up-left | up | up-right | left | stop | right | down-left | down | down-right
  speed <0-100>
  topic control|speed <name>
  buttons on|off
  broker <url>|default
  status
  help
  quit";

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command {0:?}, try 'help'")]
    Unknown(String),
    #[error("Missing {0}")]
    MissingArgument(&'static str),
    #[error("Invalid {what}: {value:?}")]
    InvalidArgument { what: &'static str, value: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One line typed by the operator
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Press(Gesture),
    Speed(f64),
    Settings(ProfileChange),
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Err(CommandError::MissingArgument("command"));
        };
        let command = command.to_ascii_lowercase();

        match command.as_str() {
            "speed" => {
                let raw = words.next().ok_or(CommandError::MissingArgument("speed"))?;
                let value = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| CommandError::InvalidArgument {
                        what: "speed",
                        value: raw.to_string(),
                    })?;
                Ok(ConsoleCommand::Speed(value))
            }
            "topic" => {
                let role = words.next().ok_or(CommandError::MissingArgument("topic role"))?;
                let name = words.next().ok_or(CommandError::MissingArgument("topic name"))?;
                match role.to_ascii_lowercase().as_str() {
                    "control" => Ok(ConsoleCommand::Settings(ProfileChange::ControlTopic(
                        name.to_string(),
                    ))),
                    "speed" => Ok(ConsoleCommand::Settings(ProfileChange::SpeedTopic(
                        name.to_string(),
                    ))),
                    _ => Err(CommandError::InvalidArgument {
                        what: "topic role",
                        value: role.to_string(),
                    }),
                }
            }
            "buttons" => {
                let raw = words.next().ok_or(CommandError::MissingArgument("on|off"))?;
                let enabled = match raw.to_ascii_lowercase().as_str() {
                    "on" | "true" => true,
                    "off" | "false" => false,
                    _ => {
                        return Err(CommandError::InvalidArgument {
                            what: "buttons option",
                            value: raw.to_string(),
                        })
                    }
                };
                Ok(ConsoleCommand::Settings(ProfileChange::ButtonsOption(enabled)))
            }
            "broker" => {
                let raw = words.next().ok_or(CommandError::MissingArgument("broker url"))?;
                let broker = if raw.eq_ignore_ascii_case("default") {
                    None
                } else {
                    Some(BrokerConfig::from_url(raw)?)
                };
                Ok(ConsoleCommand::Settings(ProfileChange::Broker(broker)))
            }
            "status" => Ok(ConsoleCommand::Status),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => other
                .parse::<Gesture>()
                .map(ConsoleCommand::Press)
                .map_err(|_| CommandError::Unknown(other.to_string())),
        }
    }
}
