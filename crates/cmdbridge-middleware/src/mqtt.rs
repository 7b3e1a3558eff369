//! MQTT implementations of the external [`Broker`] and the internal
//! [`MessageBus`], on top of [`rumqttc`].
//!
//! Both wrap a cloneable [`AsyncClient`]. Polling the matching
//! [`rumqttc::EventLoop`] is left to the owner of the connection (the daemon),
//! which forwards inbound publishes to [`CommandBridge::dispatch`] or
//! [`MqttBus::handle_incoming`].
//!
//! [`CommandBridge::dispatch`]: crate::bridge::CommandBridge::dispatch

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmdbridge_types::{BridgeError, DeliveryOptions, MessageEnvelope, QosLevel};
use rumqttc::{AsyncClient, QoS};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::bus::MessageBus;
use crate::correlation::PendingRequests;
use crate::topic::{build_topic, matches_filter};

/// Map the bridge's QoS onto the client library's.
pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// External broker backed by an MQTT client.
#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
}

impl MqttBroker {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "external MQTT disconnect");
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), BridgeError> {
        self.client
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| BridgeError::Transport(format!("could not subscribe to topic '{filter}': {e}")))
    }

    /// Resolves once the message is queued on the client's request channel.
    async fn publish(
        &self,
        topic: &str,
        options: DeliveryOptions,
        payload: Vec<u8>,
    ) -> Result<(), BridgeError> {
        self.client
            .publish(topic, to_mqtt_qos(options.qos), options.retain, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Internal message bus carried over MQTT.
///
/// Requests are published on the route's internal topic. Device services
/// reply on `<response-prefix>/<service>/<request-id>`; the connection owner
/// subscribes to [`MqttBus::response_filter`] and feeds every publish to
/// [`MqttBus::handle_incoming`].
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    response_prefix: String,
    qos: QosLevel,
    pending: Arc<PendingRequests>,
}

impl MqttBus {
    pub fn new(client: AsyncClient, response_prefix: impl Into<String>, qos: QosLevel) -> Self {
        Self {
            client,
            response_prefix: response_prefix.into(),
            qos,
            pending: Arc::new(PendingRequests::new()),
        }
    }

    /// Topic filter covering every response addressed to this bridge.
    pub fn response_filter(&self) -> String {
        build_topic(&[&self.response_prefix, "#"])
    }

    /// Subscribe to the response filter. Call on every (re)connect.
    pub async fn subscribe_responses(&self) -> Result<(), BridgeError> {
        let filter = self.response_filter();
        self.client
            .subscribe(&filter, to_mqtt_qos(self.qos))
            .await
            .map_err(|e| BridgeError::Transport(format!("could not subscribe to topic '{filter}': {e}")))
    }

    /// Complete the waiter for a response received on `topic`.
    ///
    /// Returns `false` for foreign topics, undecodable payloads and responses
    /// nobody is waiting for.
    pub fn handle_incoming(&self, topic: &str, payload: &[u8]) -> bool {
        if !matches_filter(&self.response_filter(), topic) {
            return false;
        }
        match MessageEnvelope::from_json(payload) {
            Ok(response) => self.pending.complete(response),
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropping undecodable internal response");
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "internal MQTT disconnect");
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn request(
        &self,
        request: MessageEnvelope,
        service: &str,
        topic: &str,
        timeout: Duration,
    ) -> Result<MessageEnvelope, BridgeError> {
        let pending = self.pending.register(&request.request_id)?;
        let bytes = request.to_json()?;
        self.client
            .publish(topic, to_mqtt_qos(self.qos), false, bytes)
            .await
            .map_err(|e| {
                BridgeError::Transport(format!("failed to send request to service '{service}' on '{topic}': {e}"))
            })?;
        pending.wait(timeout).await
    }
}
