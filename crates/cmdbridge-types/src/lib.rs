//! `cmdbridge-types` – shared vocabulary of the command bridge.
//!
//! - [`envelope`] – [`MessageEnvelope`], the wrapper exchanged on both the
//!   external broker and the internal message bus, plus its JSON codec.
//! - [`Method`] – the two request methods a command topic may carry.
//! - [`QosLevel`] / [`DeliveryOptions`] – broker delivery settings applied to
//!   every outbound publish.
//! - [`DeviceDescriptor`] / [`CommandDescriptor`] – the device catalogue used
//!   for routing and command queries.
//! - [`BridgeError`] – the error taxonomy shared by every crate.

pub mod envelope;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use envelope::{MessageEnvelope, API_VERSION, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT};

/// Request method carried in the last segment of a command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Read a command value.
    Get,
    /// Write a command value.
    Set,
}

impl Method {
    /// Canonical lowercase spelling, as used on the internal bus.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Set => "set",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("get") {
            Ok(Method::Get)
        } else if s.eq_ignore_ascii_case("set") {
            Ok(Method::Set)
        } else {
            Err(BridgeError::Validation(format!(
                "unknown request method: {s}, only 'get' or 'set' is allowed"
            )))
        }
    }
}

/// MQTT-style quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(BridgeError::Config(format!(
                "invalid QoS level {other}, expected 0, 1 or 2"
            ))),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> u8 {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Delivery settings applied verbatim to every outbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryOptions {
    pub qos: QosLevel,
    pub retain: bool,
}

/// A device known to the bridge and the service that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    /// Name of the device service that executes commands for this device.
    pub service: String,
    #[serde(default)]
    pub profile: String,
    /// When empty, any command name is routed to the service.
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,
}

impl DeviceDescriptor {
    pub fn command(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.name == name)
    }
}

/// A single command exposed by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    #[serde(default = "default_true")]
    pub get: bool,
    #[serde(default)]
    pub set: bool,
}

impl CommandDescriptor {
    /// Whether this command accepts requests with `method`.
    pub fn supports(&self, method: Method) -> bool {
        match method {
            Method::Get => self.get,
            Method::Set => self.set,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Every failure the bridge can observe while handling a single message.
///
/// Whether a variant is answerable depends on how far the handler got: once a
/// response topic is known, the error is turned into an error envelope;
/// before that it can only be logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("failed to decode message envelope: {0}")]
    Decode(String),

    #[error("failed to encode message envelope: {0}")]
    Encode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid topic scheme: {0}")]
    TopicScheme(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Routing(String),

    #[error("timed out after {after:?} waiting for response to request '{request_id}'")]
    Timeout { request_id: String, after: Duration },

    #[error("{0}")]
    Transport(String),

    #[error("could not publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },
}
