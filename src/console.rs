//! Station console
//!
//! Line commands typed at the station while the dispatcher runs. Vehicles
//! are addressed by their index in the roster listing.

use thiserror::Error;

use crate::network::VehicleInfo;
use crate::protocol::channels;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command: {0} (try \"help\")")]
    UnknownCommand(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid {what}: {value}")]
    InvalidArgument { what: &'static str, value: String },
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

pub const HELP: &str = "\
Commands:
  list                          show connected vehicles
  light <n> <channel> on|off    switch a light (channel: head, rear, 0, 1)
  lights <n> <channel>          read a light
  throttle <n> <percent>        set throttle, -100..100
  speed <n>                     read throttle
  stop <n>                      emergency stop
  help                          show this text";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Light { vehicle: usize, channel: u8, on: bool },
    Lights { vehicle: usize, channel: u8 },
    Throttle { vehicle: usize, percent: i8 },
    Speed { vehicle: usize },
    Stop { vehicle: usize },
    Help,
}

impl ConsoleCommand {
    /// Parse one input line; blank lines yield None
    pub fn parse(line: &str) -> ConsoleResult<Option<Self>> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Ok(None);
        };

        let command = match (verb.to_ascii_lowercase().as_str(), args) {
            ("list" | "ls", []) => ConsoleCommand::List,
            ("help" | "?", []) => ConsoleCommand::Help,
            ("light", [n, channel, state]) => ConsoleCommand::Light {
                vehicle: vehicle_index(n)?,
                channel: light_channel(channel)?,
                on: switch_state(state)?,
            },
            ("light", _) => return Err(ConsoleError::Usage("light <n> <channel> on|off")),
            ("lights", [n, channel]) => ConsoleCommand::Lights {
                vehicle: vehicle_index(n)?,
                channel: light_channel(channel)?,
            },
            ("lights", _) => return Err(ConsoleError::Usage("lights <n> <channel>")),
            ("throttle", [n, percent]) => ConsoleCommand::Throttle {
                vehicle: vehicle_index(n)?,
                percent: percent.parse().map_err(|_| invalid("percent", percent))?,
            },
            ("throttle", _) => return Err(ConsoleError::Usage("throttle <n> <percent>")),
            ("speed", [n]) => ConsoleCommand::Speed {
                vehicle: vehicle_index(n)?,
            },
            ("speed", _) => return Err(ConsoleError::Usage("speed <n>")),
            ("stop", [n]) => ConsoleCommand::Stop {
                vehicle: vehicle_index(n)?,
            },
            ("stop", _) => return Err(ConsoleError::Usage("stop <n>")),
            (other, _) => return Err(ConsoleError::UnknownCommand(other.to_string())),
        };
        Ok(Some(command))
    }
}

fn invalid(what: &'static str, value: &str) -> ConsoleError {
    ConsoleError::InvalidArgument {
        what,
        value: value.to_string(),
    }
}

fn vehicle_index(word: &str) -> ConsoleResult<usize> {
    word.parse().map_err(|_| invalid("vehicle number", word))
}

fn light_channel(word: &str) -> ConsoleResult<u8> {
    match word.to_ascii_lowercase().as_str() {
        "head" | "headlight" | "0" => Ok(channels::HEADLIGHT),
        "rear" | "1" => Ok(channels::REAR_LIGHT),
        _ => Err(invalid("light channel", word)),
    }
}

fn switch_state(word: &str) -> ConsoleResult<bool> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "1" => Ok(true),
        "off" | "0" => Ok(false),
        _ => Err(invalid("light state", word)),
    }
}

/// Run a command against the roster and describe the outcome
pub async fn execute(command: ConsoleCommand, vehicles: &[VehicleInfo]) -> String {
    let pick = |index: usize| {
        vehicles
            .get(index)
            .ok_or_else(|| format!("No vehicle {} ({} connected)", index, vehicles.len()))
    };

    let outcome = match command {
        ConsoleCommand::Help => Ok(HELP.to_string()),
        ConsoleCommand::List => Ok(list(vehicles)),
        ConsoleCommand::Light {
            vehicle,
            channel,
            on,
        } => match pick(vehicle) {
            Ok(v) => v
                .handle
                .set_light(channel, on)
                .await
                .map(|()| format!("Light {} {}", channel, if on { "on" } else { "off" }))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        ConsoleCommand::Lights { vehicle, channel } => match pick(vehicle) {
            Ok(v) => v
                .handle
                .get_light(channel)
                .await
                .map(|on| format!("Light {} is {}", channel, if on { "on" } else { "off" }))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        ConsoleCommand::Throttle { vehicle, percent } => match pick(vehicle) {
            Ok(v) => v
                .handle
                .set_throttle(percent)
                .await
                .map(|()| format!("Throttle set to {}%", percent))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        ConsoleCommand::Speed { vehicle } => match pick(vehicle) {
            Ok(v) => v
                .handle
                .get_throttle()
                .await
                .map(|percent| format!("Throttle is {}%", percent))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        ConsoleCommand::Stop { vehicle } => match pick(vehicle) {
            Ok(v) => v
                .handle
                .emergency_stop()
                .await
                .map(|()| "Stopped".to_string())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
    };

    outcome.unwrap_or_else(|e| format!("Error: {}", e))
}

fn list(vehicles: &[VehicleInfo]) -> String {
    if vehicles.is_empty() {
        return "No vehicles connected".to_string();
    }
    vehicles
        .iter()
        .enumerate()
        .map(|(index, v)| {
            let state = v.handle.device_state();
            format!(
                "[{}] {} port {}  head={} rear={} throttle={}%",
                index,
                v.addr,
                v.port,
                if state.headlight { "on" } else { "off" },
                if state.rear_light { "on" } else { "off" },
                state.throttle
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Connection, SessionConfig, SessionHandle};
    use crate::protocol::Dialect;
    use crate::vehicle::{Actuators, PropulsionActuator, Responder, SimulatedLights, SimulatedMotor};
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("  ").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("list").unwrap(), Some(ConsoleCommand::List));
        assert_eq!(
            ConsoleCommand::parse("light 0 rear on").unwrap(),
            Some(ConsoleCommand::Light {
                vehicle: 0,
                channel: channels::REAR_LIGHT,
                on: true
            })
        );
        assert_eq!(
            ConsoleCommand::parse("THROTTLE 2 -42").unwrap(),
            Some(ConsoleCommand::Throttle {
                vehicle: 2,
                percent: -42
            })
        );
        assert_eq!(
            ConsoleCommand::parse("stop 1").unwrap(),
            Some(ConsoleCommand::Stop { vehicle: 1 })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ConsoleCommand::parse("fly 1"),
            Err(ConsoleError::UnknownCommand(_))
        ));
        assert!(matches!(
            ConsoleCommand::parse("light 0 head"),
            Err(ConsoleError::Usage(_))
        ));
        assert!(matches!(
            ConsoleCommand::parse("light 0 side on"),
            Err(ConsoleError::InvalidArgument { what: "light channel", .. })
        ));
        assert!(matches!(
            ConsoleCommand::parse("throttle 0 300"),
            Err(ConsoleError::InvalidArgument { what: "percent", .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_against_vehicle() {
        let motor = Arc::new(SimulatedMotor::new());
        let actuators = Actuators::new(Arc::new(SimulatedLights::new()), motor.clone());
        let (station, vehicle) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let conn = Connection::new(vehicle, Dialect::Sequential);
            let mut responder = Responder::new(conn, actuators).await.unwrap();
            responder.run().await
        });

        let (handle, _task) = SessionHandle::spawn(
            Connection::new(station, Dialect::Sequential),
            SessionConfig::default(),
        );
        let vehicles = vec![VehicleInfo {
            id: uuid::Uuid::new_v4(),
            addr: "127.0.0.1:4001".parse().unwrap(),
            port: 4001,
            handle,
        }];

        let reply = execute(ConsoleCommand::Throttle { vehicle: 0, percent: 35 }, &vehicles).await;
        assert_eq!(reply, "Throttle set to 35%");
        assert_eq!(motor.get().await.unwrap(), 35);

        let reply = execute(ConsoleCommand::Throttle { vehicle: 0, percent: 101 }, &vehicles).await;
        assert!(reply.starts_with("Error:"));

        let reply = execute(ConsoleCommand::Speed { vehicle: 3 }, &vehicles).await;
        assert_eq!(reply, "Error: No vehicle 3 (1 connected)");

        assert!(list(&vehicles).contains("throttle=35%"));
    }
}
