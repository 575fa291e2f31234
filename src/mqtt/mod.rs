//! # MQTT Integration Module
//!
//! Broker connection and inbound message delivery for the bridge, built on `rumqttc`.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker address, subscriptions, reconnect policy
//! ├── error.rs            - MqttError
//! ├── message_manager.rs  - InboundMessage
//! └── mqtt_handler.rs     - connection lifecycle and the event loop task
//! ```
//!
//! ## Connection lifecycle
//!
//! ```text
//! Connecting ──CONNACK──► Connected ──error──► Reconnecting ──CONNACK──► Connected
//!     │                       │                     │
//!     └──error──► Failed      └──DISCONNECT──► Disconnected
//!                                                   └──attempts exhausted──► Failed
//! ```
//!
//! Reconnects back off exponentially (2 s doubling to 30 s by default). Subscriptions
//! are (re)issued whenever the broker reports no stored session for the client.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{BrokerAddress, MqttConfig, ReconnectPolicy, TopicSubscription};
pub use error::MqttError;
pub use message_manager::InboundMessage;
pub use mqtt_handler::{ConnectionState, MqttHandler};
