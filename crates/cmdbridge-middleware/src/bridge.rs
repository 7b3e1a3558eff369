//! External-broker-to-internal-bus command bridge.
//!
//! [`CommandBridge`] owns the request/response translation:
//!
//! 1. **Bootstraps** subscriptions on every broker connect
//!    ([`CommandBridge::on_connect`]).
//! 2. **Answers** command queries from the device catalogue
//!    ([`CommandBridge::handle_query`]).
//! 3. **Translates** command requests into a correlated internal bus request
//!    with a bounded wait, and publishes the reply on the external response
//!    topic ([`CommandBridge::handle_command`]).
//!
//! Every handler invocation is self-contained and publishes at most one
//! response. Once a response topic is known, every failure is answered with an
//! error envelope; before that point the message is logged and dropped (or
//! sent to the optional fallback topic).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cmdbridge_types::{BridgeError, DeliveryOptions, MessageEnvelope, Method};
use tracing::{debug, error, instrument, warn};

use crate::broker::Broker;
use crate::bus::MessageBus;
use crate::query::CommandQuery;
use crate::routing::DeviceRouter;
use crate::topic::{self, CommandTopic, keys};
use crate::validate::{validate_method, validate_query_params};

const UNANSWERABLE: &str =
    "Not publishing error message back due to insufficient information on response topic";

/// Immutable settings the bridge is constructed with.
#[derive(Debug, Clone, Default)]
pub struct BridgeSettings {
    /// External topic map, keyed by [`keys`] constants.
    pub external_topics: HashMap<String, String>,
    /// Internal topic map, keyed by [`keys`] constants.
    pub internal_topics: HashMap<String, String>,
    pub delivery: DeliveryOptions,
    pub request_timeout: Duration,
    /// Where unanswerable failures are reported, when set.
    pub fallback_topic: Option<String>,
}

impl BridgeSettings {
    fn external(&self, key: &str) -> Option<&str> {
        self.external_topics
            .get(key)
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }

    fn internal(&self, key: &str) -> Option<&str> {
        self.internal_topics
            .get(key)
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }
}

/// The bridge. Share it behind an [`Arc`]; handlers take `&self` and may run
/// concurrently.
pub struct CommandBridge {
    broker: Arc<dyn Broker>,
    bus: Arc<dyn MessageBus>,
    router: Arc<dyn DeviceRouter>,
    query: Arc<dyn CommandQuery>,
    settings: BridgeSettings,
}

impl CommandBridge {
    pub fn new(
        broker: Arc<dyn Broker>,
        bus: Arc<dyn MessageBus>,
        router: Arc<dyn DeviceRouter>,
        query: Arc<dyn CommandQuery>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            broker,
            bus,
            router,
            query,
            settings,
        }
    }

    // -----------------------------------------------------------------------
    // Connection bootstrap and dispatch
    // -----------------------------------------------------------------------

    /// Subscribe the query and command handlers to their topic filters.
    ///
    /// Subscription failures are logged; the other subscription is still
    /// attempted.
    pub async fn on_connect(&self) {
        for key in [keys::COMMAND_QUERY_REQUEST_TOPIC, keys::COMMAND_REQUEST_TOPIC] {
            let Some(filter) = self.settings.external(key) else {
                error!(key, "request topic not provided in external topics, not subscribing");
                continue;
            };
            match self.broker.subscribe(filter, self.settings.delivery.qos).await {
                Ok(()) => debug!(topic = %filter, "Subscribed to topic on external MQTT broker"),
                Err(e) => error!(topic = %filter, error = %e, "could not subscribe to topic"),
            }
        }
    }

    /// Route an inbound external message to the handler whose subscription
    /// filter matches `topic`.
    ///
    /// Exactly one handler runs per message. When the configured filters
    /// overlap, the query filter is checked first.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        if let Some(filter) = self.settings.external(keys::COMMAND_QUERY_REQUEST_TOPIC)
            && topic::matches_filter(filter, topic)
        {
            self.handle_query(topic, payload).await;
        } else if let Some(filter) = self.settings.external(keys::COMMAND_REQUEST_TOPIC)
            && topic::matches_filter(filter, topic)
        {
            self.handle_command(topic, payload).await;
        } else {
            debug!(topic = %topic, "no handler subscribed to topic");
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// Answer a command query received on `topic`.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn handle_query(&self, topic: &str, payload: &[u8]) {
        debug!(bytes = payload.len(), "Received command query request from external message broker");

        let request = match MessageEnvelope::from_json(payload) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to decode request MessageEnvelope");
                self.unanswerable(None, &e).await;
                return;
            }
        };

        let Some(response_topic) = self.settings.external(keys::QUERY_RESPONSE_TOPIC) else {
            let e = BridgeError::Config(format!(
                "{} not provided in external topics",
                keys::QUERY_RESPONSE_TOPIC
            ));
            error!(error = %e, "Query response topic is unknown");
            self.unanswerable(Some(&request), &e).await;
            return;
        };

        let device_name = topic::parse_query_topic(topic);
        let response = self
            .query
            .query(&request, &device_name)
            .await
            .unwrap_or_else(|e| MessageEnvelope::with_error(&request, e.to_string()));

        self.publish(response_topic, response).await;
    }

    /// Translate a command request received on `topic` into an internal bus
    /// request and publish the correlated reply.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn handle_command(&self, topic: &str, payload: &[u8]) {
        debug!(bytes = payload.len(), "Received command request from external message broker");

        let request = match MessageEnvelope::from_json(payload) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to decode request MessageEnvelope");
                self.unanswerable(None, &e).await;
                return;
            }
        };

        let parsed = match topic::parse_command_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "Failed to parse and construct response topic scheme");
                self.unanswerable(Some(&request), &e).await;
                return;
            }
        };

        let Some(prefix) = self.settings.external(keys::COMMAND_RESPONSE_TOPIC_PREFIX) else {
            let e = BridgeError::Config(format!(
                "{} not provided in external topics",
                keys::COMMAND_RESPONSE_TOPIC_PREFIX
            ));
            error!(error = %e, "Command response topic prefix is unknown");
            self.unanswerable(Some(&request), &e).await;
            return;
        };
        let response_topic = topic::build_response_topic(prefix, &parsed);

        let response = match self.execute(&request, &parsed).await {
            Ok(response) => response,
            Err(e) => MessageEnvelope::with_error(&request, e.to_string()),
        };
        self.publish(&response_topic, response).await;
    }

    /// Method, routing and parameter checks, then the bus round trip. The
    /// first failure decides the error envelope.
    async fn execute(
        &self,
        request: &MessageEnvelope,
        parsed: &CommandTopic,
    ) -> Result<MessageEnvelope, BridgeError> {
        let method: Method = validate_method(&parsed.method)?;

        let internal_prefix = self
            .settings
            .internal(keys::DEVICE_COMMAND_REQUEST_TOPIC_PREFIX)
            .ok_or_else(|| {
                BridgeError::Config(format!(
                    "{} not provided in internal topics",
                    keys::DEVICE_COMMAND_REQUEST_TOPIC_PREFIX
                ))
            })?;
        let route = self
            .router
            .resolve(internal_prefix, &parsed.device_name, &parsed.command_name, method)
            .await?;

        validate_query_params(method, &request.query_params)?;

        debug!(
            internal_topic = %route.topic,
            service = %route.service,
            request_id = %request.request_id,
            correlation_id = %request.correlation_id,
            "Sending Command request to internal MessageBus"
        );

        let response = self
            .bus
            .request(request.clone(), &route.service, &route.topic, self.settings.request_timeout)
            .await
            .map_err(|e| {
                BridgeError::Transport(format!(
                    "Failed to send DeviceCommand request with internal MessageBus: {e}"
                ))
            })?;

        debug!(
            request_id = %response.request_id,
            correlation_id = %response.correlation_id,
            "Command response received from internal MessageBus"
        );
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Response publishing
    // -----------------------------------------------------------------------

    /// Serialize `envelope` and publish it on `topic` with the configured
    /// delivery options. Failures are logged and never retried.
    async fn publish(&self, topic: &str, envelope: MessageEnvelope) {
        if envelope.is_error() {
            error!(request_id = %envelope.request_id, "{}", envelope.payload_text());
        }

        let bytes = match envelope.to_json() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(topic = %topic, error = %e, "Could not encode response message");
                return;
            }
        };
        let size = bytes.len();

        match self.broker.publish(topic, self.settings.delivery, bytes).await {
            Ok(()) => debug!(
                topic = %topic,
                bytes = size,
                "Published response message to external message broker"
            ),
            Err(e) => error!(
                topic = %topic,
                error = %e,
                "Could not publish to external message broker"
            ),
        }
    }

    /// Log an unanswerable failure and, when configured, report it on the
    /// fallback topic.
    async fn unanswerable(&self, request: Option<&MessageEnvelope>, e: &BridgeError) {
        let Some(fallback) = self.settings.fallback_topic.as_deref().filter(|t| !t.is_empty()) else {
            warn!("{UNANSWERABLE}");
            return;
        };
        let envelope = match request {
            Some(request) => MessageEnvelope::with_error(request, e.to_string()),
            None => MessageEnvelope::error_for("", "", e.to_string()),
        };
        warn!(fallback_topic = %fallback, "Reporting unanswerable request on fallback topic");
        self.publish(fallback, envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cmdbridge_types::{CommandDescriptor, DeviceDescriptor, QosLevel};

    use crate::bus::LocalBus;
    use crate::query::StaticCommandQuery;
    use crate::routing::StaticRouter;

    const RESPONSE_PREFIX: &str = "edgex/command/response";
    const QUERY_RESPONSE: &str = "edgex/commandquery/response";
    const COMMAND_TOPIC: &str = "edgex/command/request/sensor1/heartbeat/get";

    #[derive(Debug, Clone)]
    struct Published {
        topic: String,
        options: DeliveryOptions,
        envelope: MessageEnvelope,
    }

    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<Published>>,
        subscriptions: Mutex<Vec<(String, QosLevel)>>,
        fail_publish: bool,
    }

    impl RecordingBroker {
        fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), BridgeError> {
            self.subscriptions.lock().unwrap().push((filter.to_string(), qos));
            Ok(())
        }

        async fn publish(
            &self,
            topic: &str,
            options: DeliveryOptions,
            payload: Vec<u8>,
        ) -> Result<(), BridgeError> {
            if self.fail_publish {
                return Err(BridgeError::Publish {
                    topic: topic.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
            self.published.lock().unwrap().push(Published {
                topic: topic.to_string(),
                options,
                envelope: MessageEnvelope::from_json(&payload).unwrap(),
            });
            Ok(())
        }
    }

    /// Bus that fails every request with a transport error.
    struct BrokenBus;

    #[async_trait]
    impl MessageBus for BrokenBus {
        async fn request(
            &self,
            _request: MessageEnvelope,
            _service: &str,
            _topic: &str,
            _timeout: Duration,
        ) -> Result<MessageEnvelope, BridgeError> {
            Err(BridgeError::Transport("connection refused".to_string()))
        }
    }

    /// Query collaborator that records the device names it is asked about.
    #[derive(Default)]
    struct RecordingQuery {
        devices: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandQuery for RecordingQuery {
        async fn query(
            &self,
            request: &MessageEnvelope,
            device_name: &str,
        ) -> Result<MessageEnvelope, BridgeError> {
            self.devices.lock().unwrap().push(device_name.to_string());
            Ok(MessageEnvelope::new_response(request, Vec::new(), "application/json"))
        }
    }

    fn devices() -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor {
            name: "sensor1".to_string(),
            service: "svcA".to_string(),
            profile: "heartbeat-profile".to_string(),
            commands: vec![CommandDescriptor {
                name: "heartbeat".to_string(),
                get: true,
                set: false,
            }],
        }]
    }

    fn settings() -> BridgeSettings {
        let external_topics = [
            (keys::COMMAND_REQUEST_TOPIC, "edgex/command/request/#"),
            (keys::COMMAND_QUERY_REQUEST_TOPIC, "edgex/commandquery/request/#"),
            (keys::COMMAND_RESPONSE_TOPIC_PREFIX, RESPONSE_PREFIX),
            (keys::QUERY_RESPONSE_TOPIC, QUERY_RESPONSE),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let internal_topics = [(keys::DEVICE_COMMAND_REQUEST_TOPIC_PREFIX, "internal")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeSettings {
            external_topics,
            internal_topics,
            delivery: DeliveryOptions {
                qos: QosLevel::AtLeastOnce,
                retain: true,
            },
            request_timeout: Duration::from_millis(500),
            fallback_topic: None,
        }
    }

    struct Harness {
        broker: Arc<RecordingBroker>,
        bus: LocalBus,
        bridge: CommandBridge,
    }

    fn harness_with(settings: BridgeSettings, broker: RecordingBroker) -> Harness {
        let broker = Arc::new(broker);
        let bus = LocalBus::default();
        let bridge = CommandBridge::new(
            broker.clone(),
            Arc::new(bus.clone()),
            Arc::new(StaticRouter::new(devices())),
            Arc::new(StaticCommandQuery::new(devices())),
            settings,
        );
        Harness { broker, bus, bridge }
    }

    fn harness() -> Harness {
        harness_with(settings(), RecordingBroker::default())
    }

    /// Device service answering every request on `internal/svcA` with `payload`.
    fn spawn_service(bus: &LocalBus, payload: &'static [u8]) {
        let mut subscriber = bus.subscribe("internal/svcA");
        let responder = bus.clone();
        tokio::spawn(async move {
            while let Some(req) = subscriber.recv().await {
                let response = MessageEnvelope {
                    api_version: "v3".to_string(),
                    received_topic: String::new(),
                    correlation_id: req.envelope.correlation_id.clone(),
                    request_id: req.envelope.request_id.clone(),
                    error_code: 0,
                    payload: payload.to_vec(),
                    content_type: "application/json".to_string(),
                    query_params: Default::default(),
                };
                responder.respond(response);
            }
        });
    }

    fn request_bytes(request_id: &str) -> Vec<u8> {
        MessageEnvelope {
            api_version: "v3".to_string(),
            correlation_id: "corr-1".to_string(),
            request_id: request_id.to_string(),
            content_type: "application/json".to_string(),
            ..Default::default()
        }
        .to_json()
        .unwrap()
    }

    fn assert_single_error(h: &Harness, topic: &str, request_id: &str) -> String {
        let published = h.broker.published();
        assert_eq!(published.len(), 1, "expected exactly one publish: {published:?}");
        assert_eq!(published[0].topic, topic);
        assert_eq!(published[0].envelope.error_code, 1);
        assert_eq!(published[0].envelope.request_id, request_id);
        published[0].envelope.payload_text()
    }

    #[tokio::test]
    async fn successful_request_publishes_response_unchanged() {
        let h = harness();
        spawn_service(&h.bus, b"42");

        h.bridge.handle_command(COMMAND_TOPIC, &request_bytes("R1")).await;

        let published = h.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "edgex/command/response/sensor1/heartbeat/get");
        assert_eq!(
            published[0].options,
            DeliveryOptions {
                qos: QosLevel::AtLeastOnce,
                retain: true
            }
        );
        let envelope = &published[0].envelope;
        assert_eq!(envelope.request_id, "R1");
        assert_eq!(envelope.correlation_id, "corr-1");
        assert_eq!(envelope.error_code, 0);
        assert_eq!(envelope.payload, b"42");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_service_yields_timeout_error() {
        let h = harness();
        let _silent = h.bus.subscribe("internal/svcA");

        h.bridge.handle_command(COMMAND_TOPIC, &request_bytes("R1")).await;

        let text = assert_single_error(&h, "edgex/command/response/sensor1/heartbeat/get", "R1");
        assert!(text.contains("timed out"), "{text}");
        assert_eq!(h.bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn invalid_method_is_answered_on_mirrored_topic() {
        let h = harness();
        h.bridge
            .handle_command("edgex/command/request/sensor1/heartbeat/post", &request_bytes("R2"))
            .await;
        let text = assert_single_error(&h, "edgex/command/response/sensor1/heartbeat/post", "R2");
        assert!(text.contains("post"), "{text}");
    }

    #[tokio::test]
    async fn unknown_device_is_answered() {
        let h = harness();
        h.bridge
            .handle_command("edgex/command/request/ghost/heartbeat/get", &request_bytes("R3"))
            .await;
        let text = assert_single_error(&h, "edgex/command/response/ghost/heartbeat/get", "R3");
        assert!(text.contains("ghost"), "{text}");
    }

    #[tokio::test]
    async fn bad_query_params_are_answered() {
        let h = harness();
        let mut request = MessageEnvelope::from_json(&request_bytes("R4")).unwrap();
        request
            .query_params
            .insert("ds-returnevent".to_string(), "maybe".into());
        h.bridge
            .handle_command(COMMAND_TOPIC, &request.to_json().unwrap())
            .await;
        let text = assert_single_error(&h, "edgex/command/response/sensor1/heartbeat/get", "R4");
        assert!(text.contains("ds-returnevent"), "{text}");
    }

    #[tokio::test]
    async fn nested_query_params_are_answered() {
        let h = harness();
        let raw = br#"{"requestID":"R4n","correlationID":"corr-1","queryParams":{"ds-pushevent":{"x":"y"}}}"#;
        h.bridge.handle_command(COMMAND_TOPIC, raw).await;
        let text = assert_single_error(&h, "edgex/command/response/sensor1/heartbeat/get", "R4n");
        assert!(text.contains("ds-pushevent"), "{text}");
    }

    #[tokio::test]
    async fn empty_topic_levels_are_mirrored_in_response_topic() {
        let h = harness();
        h.bridge
            .handle_command("edgex/command/request//heartbeat/get", &request_bytes("R3e"))
            .await;
        assert_single_error(&h, "edgex/command/response//heartbeat/get", "R3e");

        let h = harness();
        h.bridge
            .handle_command("edgex/command/request/sensor1/heartbeat/", &request_bytes("R3m"))
            .await;
        assert_single_error(&h, "edgex/command/response/sensor1/heartbeat/", "R3m");
    }

    #[tokio::test]
    async fn transport_failure_is_answered_with_cause() {
        let broker = Arc::new(RecordingBroker::default());
        let bridge = CommandBridge::new(
            broker.clone(),
            Arc::new(BrokenBus),
            Arc::new(StaticRouter::new(devices())),
            Arc::new(StaticCommandQuery::new(devices())),
            settings(),
        );
        bridge.handle_command(COMMAND_TOPIC, &request_bytes("R5")).await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].envelope.is_error());
        assert!(published[0].envelope.payload_text().contains("connection refused"));
    }

    #[tokio::test]
    async fn missing_internal_prefix_is_answered() {
        let mut s = settings();
        s.internal_topics.clear();
        let h = harness_with(s, RecordingBroker::default());
        h.bridge.handle_command(COMMAND_TOPIC, &request_bytes("R6")).await;
        assert_single_error(&h, "edgex/command/response/sensor1/heartbeat/get", "R6");
    }

    #[tokio::test]
    async fn undecodable_request_is_dropped() {
        let h = harness();
        h.bridge.handle_command(COMMAND_TOPIC, b"{not json").await;
        h.bridge.handle_query("edgex/commandquery/request/all", b"\x00\x01").await;
        assert!(h.broker.published().is_empty());
    }

    #[tokio::test]
    async fn short_topic_is_dropped() {
        let h = harness();
        h.bridge.handle_command("heartbeat/get", &request_bytes("R7")).await;
        h.bridge.handle_command("get", &request_bytes("R7")).await;
        assert!(h.broker.published().is_empty());
    }

    #[tokio::test]
    async fn missing_query_response_topic_is_dropped() {
        let mut s = settings();
        s.external_topics.remove(keys::QUERY_RESPONSE_TOPIC);
        let h = harness_with(s, RecordingBroker::default());
        h.bridge
            .handle_query("edgex/commandquery/request/sensor1", &request_bytes("Q1"))
            .await;
        assert!(h.broker.published().is_empty());
    }

    #[tokio::test]
    async fn fallback_topic_receives_unanswerable_errors() {
        let mut s = settings();
        s.fallback_topic = Some("edgex/command/deadletter".to_string());
        let h = harness_with(s, RecordingBroker::default());

        h.bridge.handle_command("a/b", &request_bytes("R8")).await;
        h.bridge.handle_command(COMMAND_TOPIC, b"garbage").await;

        let published = h.broker.published();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|p| p.topic == "edgex/command/deadletter"));
        assert!(published.iter().all(|p| p.envelope.is_error()));
        assert_eq!(published[0].envelope.request_id, "R8");
        assert_eq!(published[1].envelope.request_id, "");
    }

    #[tokio::test]
    async fn query_is_answered_on_configured_topic() {
        let h = harness();
        h.bridge
            .handle_query("edgex/commandquery/request/sensor1", &request_bytes("Q2"))
            .await;
        let published = h.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, QUERY_RESPONSE);
        assert_eq!(published[0].envelope.request_id, "Q2");
        assert!(!published[0].envelope.is_error());
    }

    #[tokio::test]
    async fn failed_query_is_answered_with_error() {
        let h = harness();
        h.bridge
            .handle_query("edgex/commandquery/request/ghost", &request_bytes("Q3"))
            .await;
        let text = assert_single_error(&h, QUERY_RESPONSE, "Q3");
        assert!(text.contains("ghost"));
    }

    #[tokio::test]
    async fn query_all_is_case_insensitive() {
        let broker = Arc::new(RecordingBroker::default());
        let query = Arc::new(RecordingQuery::default());
        let bridge = CommandBridge::new(
            broker.clone(),
            Arc::new(LocalBus::default()),
            Arc::new(StaticRouter::default()),
            query.clone(),
            settings(),
        );
        for device in ["All", "all", "ALL"] {
            bridge
                .handle_query(&format!("edgex/commandquery/request/{device}"), &request_bytes("Q"))
                .await;
        }
        assert_eq!(*query.devices.lock().unwrap(), vec!["all", "all", "all"]);
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let h = harness_with(
            settings(),
            RecordingBroker {
                fail_publish: true,
                ..Default::default()
            },
        );
        h.bridge
            .handle_command("edgex/command/request/ghost/heartbeat/get", &request_bytes("R9"))
            .await;
        // Bridge stays usable for the next message.
        spawn_service(&h.bus, b"ok");
        h.bridge.handle_command(COMMAND_TOPIC, &request_bytes("R10")).await;
        assert!(h.broker.published().is_empty());
    }

    #[tokio::test]
    async fn on_connect_subscribes_both_filters() {
        let h = harness();
        h.bridge.on_connect().await;
        let subs = h.broker.subscriptions.lock().unwrap().clone();
        assert_eq!(
            subs,
            vec![
                ("edgex/commandquery/request/#".to_string(), QosLevel::AtLeastOnce),
                ("edgex/command/request/#".to_string(), QosLevel::AtLeastOnce),
            ]
        );
    }

    #[tokio::test]
    async fn dispatch_routes_by_filter() {
        let h = harness();
        spawn_service(&h.bus, b"1");
        h.bridge.dispatch(COMMAND_TOPIC, &request_bytes("R11")).await;
        h.bridge
            .dispatch("edgex/commandquery/request/sensor1", &request_bytes("Q4"))
            .await;
        h.bridge.dispatch("unrelated/topic/a/b/c", &request_bytes("X")).await;

        let topics: Vec<String> = h.broker.published().into_iter().map(|p| p.topic).collect();
        assert_eq!(
            topics,
            vec![
                "edgex/command/response/sensor1/heartbeat/get".to_string(),
                QUERY_RESPONSE.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn overlapping_filters_run_one_handler() {
        let mut settings = settings();
        for key in [keys::COMMAND_REQUEST_TOPIC, keys::COMMAND_QUERY_REQUEST_TOPIC] {
            settings.external_topics.insert(key.to_string(), "edgex/#".to_string());
        }
        let h = harness_with(settings, RecordingBroker::default());
        h.bridge
            .dispatch("edgex/commandquery/request/sensor1", &request_bytes("Q5"))
            .await;

        let published = h.broker.published();
        assert_eq!(published.len(), 1, "{published:?}");
        assert_eq!(published[0].topic, QUERY_RESPONSE);
        assert!(!published[0].envelope.is_error());
    }

    #[tokio::test]
    async fn concurrent_requests_are_answered_independently() {
        let h = Arc::new(harness());
        spawn_service(&h.bus, b"42");
        let mut tasks = Vec::new();
        for i in 0..8 {
            let h = Arc::clone(&h);
            tasks.push(tokio::spawn(async move {
                h.bridge
                    .handle_command(COMMAND_TOPIC, &request_bytes(&format!("R{i}")))
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let mut ids: Vec<String> = h
            .broker
            .published()
            .into_iter()
            .map(|p| p.envelope.request_id)
            .collect();
        ids.sort();
        assert_eq!(ids, (0..8).map(|i| format!("R{i}")).collect::<Vec<_>>());
    }
}
