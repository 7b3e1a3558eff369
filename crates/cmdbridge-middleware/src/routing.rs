//! Device-service routing: map `(device, command, method)` onto the service
//! that owns the device and the internal topic it listens on.

use std::collections::HashMap;

use async_trait::async_trait;
use cmdbridge_types::{BridgeError, DeviceDescriptor, Method};

use crate::topic::build_topic;

/// Resolved internal destination of a command request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub service: String,
    /// `<prefix>/<service>/<device>/<command>/<method>`.
    pub topic: String,
}

/// Lookup collaborator used by the command request handler.
#[async_trait]
pub trait DeviceRouter: Send + Sync {
    async fn resolve(
        &self,
        prefix: &str,
        device_name: &str,
        command_name: &str,
        method: Method,
    ) -> Result<Route, BridgeError>;
}

/// Router over a fixed device catalogue.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    devices: HashMap<String, DeviceDescriptor>,
}

impl StaticRouter {
    pub fn new(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }
}

#[async_trait]
impl DeviceRouter for StaticRouter {
    async fn resolve(
        &self,
        prefix: &str,
        device_name: &str,
        command_name: &str,
        method: Method,
    ) -> Result<Route, BridgeError> {
        let device = self
            .devices
            .get(device_name)
            .ok_or_else(|| BridgeError::Routing(format!("device '{device_name}' not found")))?;

        if !device.commands.is_empty() {
            let command = device.command(command_name).ok_or_else(|| {
                BridgeError::Routing(format!(
                    "command '{command_name}' not found on device '{device_name}'"
                ))
            })?;
            if !command.supports(method) {
                return Err(BridgeError::Routing(format!(
                    "command '{command_name}' on device '{device_name}' does not support '{method}'"
                )));
            }
        }

        Ok(Route {
            service: device.service.clone(),
            topic: build_topic(&[
                prefix,
                &device.service,
                device_name,
                command_name,
                method.as_str(),
            ]),
        })
    }
}
