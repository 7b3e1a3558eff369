//! Command queries: "which commands does device X expose?".

use async_trait::async_trait;
use cmdbridge_types::{BridgeError, CONTENT_TYPE_JSON, DeviceDescriptor, MessageEnvelope, API_VERSION};
use serde::Serialize;

use crate::topic::ALL_DEVICES;

/// Query parameter: number of devices to skip when listing all devices.
pub const OFFSET: &str = "offset";
/// Query parameter: maximum number of devices to list, `-1` for no limit.
pub const LIMIT: &str = "limit";

/// Collaborator answering command queries.
#[async_trait]
pub trait CommandQuery: Send + Sync {
    /// Produce the response envelope for `request` about `device_name`
    /// (which may be [`ALL_DEVICES`]).
    async fn query(
        &self,
        request: &MessageEnvelope,
        device_name: &str,
    ) -> Result<MessageEnvelope, BridgeError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CoreCommand<'a> {
    name: &'a str,
    get: bool,
    set: bool,
    path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCoreCommand<'a> {
    device_name: &'a str,
    profile_name: &'a str,
    core_commands: Vec<CoreCommand<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCoreCommandResponse<'a> {
    api_version: &'static str,
    status_code: u16,
    device_core_command: DeviceCoreCommand<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MultiDeviceCoreCommandsResponse<'a> {
    api_version: &'static str,
    status_code: u16,
    total_count: usize,
    device_core_commands: Vec<DeviceCoreCommand<'a>>,
}

/// Command query over a fixed device catalogue, in catalogue order.
#[derive(Debug, Clone, Default)]
pub struct StaticCommandQuery {
    devices: Vec<DeviceDescriptor>,
}

impl StaticCommandQuery {
    pub fn new(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
        }
    }

    fn core_command(device: &DeviceDescriptor) -> DeviceCoreCommand<'_> {
        DeviceCoreCommand {
            device_name: &device.name,
            profile_name: &device.profile,
            core_commands: device
                .commands
                .iter()
                .map(|c| CoreCommand {
                    name: &c.name,
                    get: c.get,
                    set: c.set,
                    path: format!("/api/{API_VERSION}/device/name/{}/{}", device.name, c.name),
                })
                .collect(),
        }
    }
}

fn int_param(request: &MessageEnvelope, name: &str, default: i64) -> Result<i64, BridgeError> {
    let Some(value) = request.query_params.get(name) else {
        return Ok(default);
    };
    value
        .as_str()
        .and_then(|raw| raw.trim().parse().ok())
        .ok_or_else(|| {
            BridgeError::Validation(format!("invalid query parameter {name}: {value} is not an integer"))
        })
}

#[async_trait]
impl CommandQuery for StaticCommandQuery {
    async fn query(
        &self,
        request: &MessageEnvelope,
        device_name: &str,
    ) -> Result<MessageEnvelope, BridgeError> {
        let body = if device_name == ALL_DEVICES {
            let offset = int_param(request, OFFSET, 0)?;
            let limit = int_param(request, LIMIT, -1)?;
            if offset < 0 {
                return Err(BridgeError::Validation(format!(
                    "invalid query parameter {OFFSET}: {offset} must not be negative"
                )));
            }
            if limit < -1 {
                return Err(BridgeError::Validation(format!(
                    "invalid query parameter {LIMIT}: {limit} must be -1 or greater"
                )));
            }
            let take = usize::try_from(limit).unwrap_or(usize::MAX);
            let commands = self
                .devices
                .iter()
                .skip(offset as usize)
                .take(take)
                .map(Self::core_command)
                .collect();
            serde_json::to_vec(&MultiDeviceCoreCommandsResponse {
                api_version: API_VERSION,
                status_code: 200,
                total_count: self.devices.len(),
                device_core_commands: commands,
            })
        } else {
            let device = self
                .devices
                .iter()
                .find(|d| d.name == device_name)
                .ok_or_else(|| BridgeError::Routing(format!("device '{device_name}' not found")))?;
            serde_json::to_vec(&DeviceCoreCommandResponse {
                api_version: API_VERSION,
                status_code: 200,
                device_core_command: Self::core_command(device),
            })
        }
        .map_err(|e| BridgeError::Encode(e.to_string()))?;

        Ok(MessageEnvelope::new_response(request, body, CONTENT_TYPE_JSON))
    }
}
