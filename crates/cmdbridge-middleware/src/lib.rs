//! `cmdbridge-middleware` – the request/response translation engine.
//!
//! Bridges a topic-addressed external publish/subscribe broker onto an
//! internal message bus with correlated, time-bounded request/response.
//!
//! # Modules
//!
//! - [`topic`] – parsing and construction of request/response topics, plus
//!   MQTT wildcard matching.
//! - [`validate`] – method and query-parameter gates.
//! - [`correlation`] – waiters keyed by request ID with a bounded wait.
//! - [`bus`] – the [`MessageBus`] seam and the in-process [`LocalBus`].
//! - [`broker`] – the [`Broker`] seam to the external broker.
//! - [`mqtt`] – MQTT implementations of both seams.
//! - [`routing`] – device-to-service routing ([`DeviceRouter`]).
//! - [`query`] – command queries ([`CommandQuery`]).
//! - [`bridge`] – [`CommandBridge`], the handlers tying it all together.

pub mod bridge;
pub mod broker;
pub mod bus;
pub mod correlation;
pub mod mqtt;
pub mod query;
pub mod routing;
pub mod topic;
pub mod validate;

pub use bridge::{BridgeSettings, CommandBridge};
pub use broker::Broker;
pub use bus::{BusRequest, LocalBus, MessageBus, ServiceSubscriber};
pub use correlation::PendingRequests;
pub use mqtt::{MqttBroker, MqttBus};
pub use query::{CommandQuery, StaticCommandQuery};
pub use routing::{DeviceRouter, Route, StaticRouter};
