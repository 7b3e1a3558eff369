//! The bridge daemon: wires the configured collaborators together and drives
//! both MQTT connections until shutdown.

use std::sync::Arc;
use std::time::Duration;

use cmdbridge_middleware::topic::keys;
use cmdbridge_middleware::{CommandBridge, MqttBroker, MqttBus, StaticCommandQuery, StaticRouter};
use cmdbridge_types::BridgeError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{Config, ConnectionConfig};

/// Capacity of each client's outgoing request channel.
const CLIENT_CHANNEL_CAPACITY: usize = 64;
/// Pause after a connection error before the event loop reconnects.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Build client options for one broker connection.
///
/// An empty client ID is replaced by `<fallback_prefix>-<uuid>`.
pub fn mqtt_options(conn: &ConnectionConfig, fallback_prefix: &str) -> MqttOptions {
    let client_id = if conn.client_id.trim().is_empty() {
        format!("{fallback_prefix}-{}", uuid::Uuid::new_v4())
    } else {
        conn.client_id.clone()
    };
    let mut options = MqttOptions::new(client_id, conn.host.clone(), conn.port);
    options.set_keep_alive(Duration::from_secs(conn.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    if !conn.username.is_empty() {
        options.set_credentials(conn.username.clone(), conn.password.clone());
    }
    options
}

/// What an event loop forwards its inbound traffic to.
enum Link {
    External(Arc<CommandBridge>),
    Internal(MqttBus),
}

impl Link {
    fn name(&self) -> &'static str {
        match self {
            Link::External(_) => "external",
            Link::Internal(_) => "message-bus",
        }
    }

    fn on_connack(&self) {
        match self {
            Link::External(bridge) => {
                let bridge = Arc::clone(bridge);
                tokio::spawn(async move { bridge.on_connect().await });
            }
            Link::Internal(bus) => {
                let bus = bus.clone();
                tokio::spawn(async move {
                    match bus.subscribe_responses().await {
                        Ok(()) => debug!(topic = %bus.response_filter(), "Subscribed to internal response topic"),
                        Err(e) => error!(error = %e, "could not subscribe to internal response topic"),
                    }
                });
            }
        }
    }

    fn on_publish(&self, topic: String, payload: Vec<u8>) {
        match self {
            Link::External(bridge) => {
                let bridge = Arc::clone(bridge);
                let span = info_span!("external_message", topic = %topic);
                tokio::spawn(async move { bridge.dispatch(&topic, &payload).await }.instrument(span));
            }
            Link::Internal(bus) => {
                if !bus.handle_incoming(&topic, &payload) {
                    debug!(topic = %topic, "internal response matched no pending request");
                }
            }
        }
    }
}

/// Resolves once shutdown is requested. A dropped sender never stops the
/// daemon.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Poll `eventloop` until `shutdown` flips, forwarding events to `link`.
async fn drive(mut eventloop: EventLoop, link: Link, mut shutdown: watch::Receiver<bool>) {
    let name = link.name();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => {
                debug!(link = name, "shutdown signal received");
                return;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(link = name, "connected to MQTT broker");
                    link.on_connack();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(link = name, topic = %publish.topic, size = publish.payload.len(), "received message");
                    link.on_publish(publish.topic, publish.payload.to_vec());
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!(link = name, "subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(link = name, error = %e, "MQTT connection error, reconnecting");
                    tokio::select! {
                        _ = stopped(&mut shutdown) => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
}

/// Run the bridge until `shutdown` is signalled.
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
    let settings = config.bridge_settings();
    let response_prefix = settings
        .internal_topics
        .get(keys::COMMAND_RESPONSE_TOPIC_PREFIX)
        .filter(|t| !t.is_empty())
        .cloned()
        .ok_or_else(|| {
            BridgeError::Config(format!(
                "{} not provided in message_bus.topics",
                keys::COMMAND_RESPONSE_TOPIC_PREFIX
            ))
        })?;

    let (bus_client, bus_loop) = AsyncClient::new(
        mqtt_options(&config.message_bus.connection, "cmdbridge-internal"),
        CLIENT_CHANNEL_CAPACITY,
    );
    let bus = MqttBus::new(bus_client, response_prefix, config.message_bus.qos);

    let (ext_client, ext_loop) = AsyncClient::new(
        mqtt_options(&config.external_mqtt.connection, "cmdbridge-external"),
        CLIENT_CHANNEL_CAPACITY,
    );
    let broker = MqttBroker::new(ext_client);

    let bridge = Arc::new(CommandBridge::new(
        Arc::new(broker.clone()),
        Arc::new(bus.clone()),
        Arc::new(StaticRouter::new(config.devices.clone())),
        Arc::new(StaticCommandQuery::new(config.devices.clone())),
        settings,
    ));

    info!(
        external = %format!("{}:{}", config.external_mqtt.connection.host, config.external_mqtt.connection.port),
        message_bus = %format!("{}:{}", config.message_bus.connection.host, config.message_bus.connection.port),
        devices = config.devices.len(),
        timeout_ms = config.request_timeout_ms,
        "starting command bridge"
    );

    let internal = tokio::spawn(drive(bus_loop, Link::Internal(bus.clone()), shutdown.clone()));
    let external = tokio::spawn(drive(ext_loop, Link::External(bridge), shutdown));

    let (internal, external) = tokio::join!(internal, external);
    for (name, result) in [("message-bus", internal), ("external", external)] {
        if let Err(e) = result {
            error!(link = name, error = %e, "event loop task failed");
        }
    }

    broker.disconnect().await;
    bus.disconnect().await;
    info!("command bridge stopped");
    Ok(())
}
