//! Topic scheme shared by the bridge and its external clients.
//!
//! Topics are `/`-delimited. Routing information lives in the *trailing*
//! segments, so any prefix (including broker-specific wildcards) is accepted:
//!
//! | Topic | Scheme |
//! |---|---|
//! | query request | `<prefix>/<device-name>` (or the `all` sentinel) |
//! | command request | `<prefix>/<device-name>/<command-name>/<method>` |
//! | command response | `<response-prefix>/<device-name>/<command-name>/<method>` |

use cmdbridge_types::BridgeError;

/// Device-name sentinel meaning "every device".
pub const ALL_DEVICES: &str = "all";

/// Configuration keys of the external topic map.
pub mod keys {
    pub const COMMAND_REQUEST_TOPIC: &str = "CommandRequestTopic";
    pub const COMMAND_QUERY_REQUEST_TOPIC: &str = "CommandQueryRequestTopic";
    pub const COMMAND_RESPONSE_TOPIC_PREFIX: &str = "CommandResponseTopicPrefix";
    pub const QUERY_RESPONSE_TOPIC: &str = "QueryResponseTopic";
    /// Internal topic map: prefix of device-service command requests.
    pub const DEVICE_COMMAND_REQUEST_TOPIC_PREFIX: &str = "DeviceCommandRequestTopicPrefix";
}

/// `(device, command, method)` parsed from a command request topic.
///
/// `method` is kept verbatim so that the response topic mirrors the request
/// topic even when the method turns out to be invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub device_name: String,
    pub command_name: String,
    pub method: String,
}

/// Extract the device name from a query request topic.
///
/// Any casing of `all` is normalised to [`ALL_DEVICES`].
pub fn parse_query_topic(topic: &str) -> String {
    let device_name = topic.rsplit('/').next().unwrap_or_default();
    if device_name.eq_ignore_ascii_case(ALL_DEVICES) {
        ALL_DEVICES.to_string()
    } else {
        device_name.to_string()
    }
}

/// Parse the last three segments of a command request topic.
pub fn parse_command_topic(topic: &str) -> Result<CommandTopic, BridgeError> {
    let levels: Vec<&str> = topic.split('/').collect();
    let [.., device_name, command_name, method] = levels.as_slice() else {
        return Err(BridgeError::TopicScheme(format!(
            "'{topic}' has {} level(s), expected request topic scheme '#/<device-name>/<command-name>/<method>'",
            levels.len()
        )));
    };
    Ok(CommandTopic {
        device_name: device_name.to_string(),
        command_name: command_name.to_string(),
        method: method.to_string(),
    })
}

/// `<prefix>/<device>/<command>/<method>`.
///
/// The request's levels are copied verbatim, empty ones included, so the
/// reply lands on the address the client derived from its own request.
pub fn build_response_topic(prefix: &str, topic: &CommandTopic) -> String {
    [
        prefix.trim_end_matches('/'),
        &topic.device_name,
        &topic.command_name,
        &topic.method,
    ]
    .join("/")
}

/// Join topic levels with `/`, ignoring empty levels and stray separators at
/// the joints.
pub fn build_topic(levels: &[&str]) -> String {
    levels
        .iter()
        .map(|level| level.trim_matches('/'))
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// MQTT topic-filter matching with `+` (one level) and `#` (remaining
/// levels) wildcards.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
