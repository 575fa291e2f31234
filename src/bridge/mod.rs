//! # Message Bridge
//!
//! Forwards inbound MQTT messages into the sequential record store.
//!
//! ```text
//! bridge/
//! ├── payload.rs  - tagged payload decoding
//! ├── record.rs   - record layout and receipt timestamps
//! ├── handler.rs  - MessageBridge: one message in, at most one record out
//! ├── consume.rs  - cancellable consume loop and session wrapper
//! └── error.rs    - BridgeError
//! ```
//!
//! ## Data flow
//!
//! ```text
//! MqttHandler ─[InboundMessage]→ consume loop ─→ MessageBridge ─[Record]→ RecordStore
//!              (delivery queue)                  (parse + stamp)          (channel = topic)
//! ```
//!
//! Malformed payloads are logged and skipped. A write the store refuses ends the loop,
//! after which the session disconnects from the broker.

pub mod consume;
pub mod error;
pub mod handler;
pub mod payload;
pub mod record;

pub use consume::{consume, run_session, ConsumeSummary, SessionOutcome, StopReason, Subscription};
pub use error::BridgeError;
pub use handler::{ChannelSettings, MessageBridge};
pub use record::{Record, RECORD_SIZE};
