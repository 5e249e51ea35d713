use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every command name that crosses a realm boundary.
///
/// The set is closed: an inbound envelope whose name does not parse into one of
/// these variants is dropped by the dispatcher so that realms running different
/// protocol revisions keep talking to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Ping,
    Pong,
    ScriptData,
    Command,
    Callback,
    RunAt,
    InjectList,
    SetTimeout,
    CheckScript,
    Expose,
    UpdateValue,
}

impl CommandName {
    pub const ALL: [CommandName; 11] = [
        CommandName::Ping,
        CommandName::Pong,
        CommandName::ScriptData,
        CommandName::Command,
        CommandName::Callback,
        CommandName::RunAt,
        CommandName::InjectList,
        CommandName::SetTimeout,
        CommandName::CheckScript,
        CommandName::Expose,
        CommandName::UpdateValue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::Ping => "Ping",
            CommandName::Pong => "Pong",
            CommandName::ScriptData => "ScriptData",
            CommandName::Command => "Command",
            CommandName::Callback => "Callback",
            CommandName::RunAt => "RunAt",
            CommandName::InjectList => "InjectList",
            CommandName::SetTimeout => "SetTimeout",
            CommandName::CheckScript => "CheckScript",
            CommandName::Expose => "Expose",
            CommandName::UpdateValue => "UpdateValue",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command `{}`", self.0)
    }
}

impl FromStr for CommandName {
    type Err = UnknownCommand;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        CommandName::ALL
            .into_iter()
            .find(|name| name.as_str() == value)
            .ok_or_else(|| UnknownCommand(value.to_string()))
    }
}

/// A single message travelling between two realms.
///
/// On the wire this is `{"cmd": .., "data": .., "callbackId": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(rename = "data", default)]
    pub payload: Value,
    #[serde(
        rename = "callbackId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub callback_id: Option<String>,
}

impl Envelope {
    pub fn new(command: CommandName, payload: Value) -> Self {
        Self {
            command: command.as_str().to_string(),
            payload,
            callback_id: None,
        }
    }

    pub fn with_callback(mut self, callback_id: impl Into<String>) -> Self {
        self.callback_id = Some(callback_id.into());
        self
    }

    /// Parse the command name. `None` means the sender speaks a command this
    /// realm does not know about.
    pub fn command_name(&self) -> Option<CommandName> {
        self.command.parse().ok()
    }
}

/// Payload of the reserved `Callback` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackReply {
    #[serde(rename = "callbackId")]
    pub callback_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_names_round_trip_through_strings() {
        for name in CommandName::ALL {
            assert_eq!(name.as_str().parse::<CommandName>(), Ok(name));
        }
        assert!("Frobnicate".parse::<CommandName>().is_err());
    }

    #[test]
    fn envelope_uses_short_wire_keys() {
        let envelope = Envelope::new(CommandName::CheckScript, json!({"name": "a"}))
            .with_callback("cb-1");
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            wire,
            json!({"cmd": "CheckScript", "data": {"name": "a"}, "callbackId": "cb-1"})
        );
    }

    #[test]
    fn envelope_without_data_defaults_to_null() {
        let envelope: Envelope = serde_json::from_str(r#"{"cmd":"Ping"}"#).unwrap();
        assert_eq!(envelope.command_name(), Some(CommandName::Ping));
        assert!(envelope.payload.is_null());
        assert!(envelope.callback_id.is_none());
    }
}
