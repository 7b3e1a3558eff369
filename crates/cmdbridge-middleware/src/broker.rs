//! The external publish/subscribe broker seen by the bridge.
//!
//! The bridge never speaks to a concrete client library. It calls through
//! [`Broker`], which [`MqttBroker`][crate::mqtt::MqttBroker] implements for
//! MQTT and test fakes implement in memory.

use async_trait::async_trait;
use cmdbridge_types::{BridgeError, DeliveryOptions, QosLevel};

/// Every external-broker client must implement this trait.
///
/// # Contract
///
/// * `subscribe` – registers interest in `filter`. Delivery of matching
///   messages is the client's job; it hands them to
///   [`CommandBridge::dispatch`][crate::bridge::CommandBridge::dispatch].
///
/// * `publish` – submits `payload` on `topic` and resolves once the client has
///   accepted it. Failures are reported as [`BridgeError::Publish`] and are
///   never retried by the caller.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), BridgeError>;

    /// Submit `payload` on `topic`.
    ///
    /// `Ok` means the client accepted the message for delivery, not that the
    /// broker acknowledged it. With QoS 1 or 2 the acknowledgment arrives
    /// later on the client's event loop and is not reported back here.
    async fn publish(
        &self,
        topic: &str,
        options: DeliveryOptions,
        payload: Vec<u8>,
    ) -> Result<(), BridgeError>;
}
