use thiserror::Error;

use super::payload::PayloadError;
use crate::store::StoreError;

/// Failures of a single [`handle`](super::MessageBridge::handle) call
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The message was skipped; nothing was written
    #[error("malformed payload on topic {topic:?}: {source}")]
    MalformedPayload {
        topic: String,
        #[source]
        source: PayloadError,
    },

    /// The store refused the record. Ends the consume loop.
    #[error("record store rejected write to channel {channel:?}: {source}")]
    StoreWrite {
        channel: String,
        #[source]
        source: StoreError,
    },
}

impl BridgeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::StoreWrite { .. })
    }
}
