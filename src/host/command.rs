use std::str::FromStr;
use thiserror::Error;

use crate::config::{ConfigError, InputMode};

/// One line typed into the stand-in host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Vibrate(f32),
    Tap,
    Relative {
        value: f32,
        relative_to: f32,
        min_speed: Option<f32>,
    },
    EmergencyStop(bool),
    Mode(InputMode),
    Strength(f32),
    Reconnect,
    Disconnect,
    Devices,
    Status,
    Reload,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0:?}")]
    Unknown(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("not a number: {0:?}")]
    InvalidNumber(String),

    #[error(transparent)]
    InvalidMode(#[from] ConfigError),
}

fn number(arg: Option<&str>, name: &'static str) -> Result<f32, CommandError> {
    let arg = arg.ok_or(CommandError::MissingArgument(name))?;
    arg.parse()
        .map_err(|_| CommandError::InvalidNumber(arg.to_string()))
}

impl FromStr for HostCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?.to_ascii_lowercase();
        let command = match verb.as_str() {
            "vibrate" | "v" => HostCommand::Vibrate(number(words.next(), "speed")?),
            "tap" | "t" => HostCommand::Tap,
            "relative" | "rel" => HostCommand::Relative {
                value: number(words.next(), "value")?,
                relative_to: number(words.next(), "relative_to")?,
                min_speed: words
                    .next()
                    .map(|arg| number(Some(arg), "min_speed"))
                    .transpose()?,
            },
            "stop" => HostCommand::EmergencyStop(true),
            "resume" => HostCommand::EmergencyStop(false),
            "mode" => HostCommand::Mode(
                words
                    .next()
                    .ok_or(CommandError::MissingArgument("mode"))?
                    .parse()?,
            ),
            "strength" => HostCommand::Strength(number(words.next(), "multiplier")?),
            "reconnect" => HostCommand::Reconnect,
            "disconnect" => HostCommand::Disconnect,
            "devices" => HostCommand::Devices,
            "status" => HostCommand::Status,
            "reload" => HostCommand::Reload,
            "quit" | "exit" | "q" => HostCommand::Quit,
            _ => return Err(CommandError::Unknown(verb)),
        };
        Ok(command)
    }
}
