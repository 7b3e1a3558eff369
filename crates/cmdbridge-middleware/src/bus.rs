//! Internal message bus: correlated request/response with a bounded wait.
//!
//! [`MessageBus`] is the seam the bridge calls through. Two implementations
//! exist:
//!
//! * [`LocalBus`] – in-process, built on [`tokio::sync::broadcast`]. Device
//!   services subscribe by topic prefix and answer through
//!   [`LocalBus::respond`]. Used for embedding and tests.
//! * [`MqttBus`][crate::mqtt::MqttBus] – requests travel over an MQTT broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmdbridge_types::{BridgeError, MessageEnvelope};
use tokio::sync::broadcast;
use tracing::warn;

use crate::correlation::PendingRequests;

/// Default channel capacity (number of buffered requests before old ones are
/// dropped for slow device services).
const DEFAULT_CAPACITY: usize = 256;

/// Request/response primitive of the internal bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send `request` to `service` on `topic` and wait at most `timeout` for
    /// the response correlated by `requestID`.
    async fn request(
        &self,
        request: MessageEnvelope,
        service: &str,
        topic: &str,
        timeout: Duration,
    ) -> Result<MessageEnvelope, BridgeError>;
}

/// A request as seen by a device service on the [`LocalBus`].
#[derive(Debug, Clone)]
pub struct BusRequest {
    pub service: String,
    pub topic: String,
    pub envelope: MessageEnvelope,
}

/// In-process internal bus. Clone it cheaply – all clones share the same
/// channel and pending-request table.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<BusRequest>,
    pending: Arc<PendingRequests>,
}

impl LocalBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            pending: Arc::new(PendingRequests::new()),
        }
    }

    /// Subscribe to requests whose topic starts with `topic_prefix`.
    pub fn subscribe(&self, topic_prefix: impl Into<String>) -> ServiceSubscriber {
        ServiceSubscriber {
            topic_prefix: topic_prefix.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Deliver a device-service response to its waiting requester.
    ///
    /// Returns `false` when the request is unknown or already timed out; the
    /// response is dropped in that case.
    pub fn respond(&self, response: MessageEnvelope) -> bool {
        self.pending.complete(response)
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn request(
        &self,
        request: MessageEnvelope,
        service: &str,
        topic: &str,
        timeout: Duration,
    ) -> Result<MessageEnvelope, BridgeError> {
        let pending = self.pending.register(&request.request_id)?;
        let bus_request = BusRequest {
            service: service.to_string(),
            topic: topic.to_string(),
            envelope: request,
        };
        if self.sender.send(bus_request).is_err() {
            return Err(BridgeError::Transport(format!(
                "no device service is listening on '{topic}'"
            )));
        }
        pending.wait(timeout).await
    }
}

/// A device-service subscription that only yields requests whose topic
/// starts with the given prefix.
pub struct ServiceSubscriber {
    topic_prefix: String,
    receiver: broadcast::Receiver<BusRequest>,
}

impl ServiceSubscriber {
    /// Wait for the next matching request.
    ///
    /// Returns `None` when the bus is closed and no further requests will
    /// arrive.
    pub async fn recv(&mut self) -> Option<BusRequest> {
        loop {
            match self.receiver.recv().await {
                Ok(request) if request.topic.starts_with(&self.topic_prefix) => {
                    return Some(request);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic_prefix = %self.topic_prefix, lagged_by = n, "ServiceSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
