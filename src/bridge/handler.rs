use std::collections::HashSet;
use tracing::{debug, info};

use super::error::BridgeError;
use super::payload::TaggedPayload;
use super::record::{Record, RECORD_SIZE};
use crate::mqtt::message_manager::InboundMessage;
use crate::store::RecordStore;

/// Provisioning parameters for the channels the bridge writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub record_size: usize,
    pub capacity_hint: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            record_size: RECORD_SIZE,
            capacity_hint: 10_000,
        }
    }
}

/// Turns inbound messages into records on the channel named by their topic
///
/// Holds no state besides the store handle and the names of channels it has already
/// provisioned. Channels not provisioned up front (e.g. topics matched by a wildcard
/// subscription) are created on their first message.
pub struct MessageBridge<S> {
    store: S,
    settings: ChannelSettings,
    provisioned: HashSet<String>,
}

impl<S: RecordStore> MessageBridge<S> {
    pub fn new(store: S, settings: ChannelSettings) -> Self {
        Self {
            store,
            settings,
            provisioned: HashSet::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn provision(&mut self, channel: &str) -> Result<(), BridgeError> {
        if self.provisioned.contains(channel) {
            return Ok(());
        }
        self.store
            .create_channel(channel, self.settings.record_size, self.settings.capacity_hint)
            .map_err(|source| BridgeError::StoreWrite {
                channel: channel.to_string(),
                source,
            })?;
        info!("Provisioned channel {}", channel);
        self.provisioned.insert(channel.to_string());
        Ok(())
    }

    /// Parses one message and appends its record, returning the assigned sequence number
    pub fn handle(&mut self, message: &InboundMessage) -> Result<u64, BridgeError> {
        let topic = message.topic();
        let payload = TaggedPayload::parse_bytes(message.payload()).map_err(|source| {
            BridgeError::MalformedPayload {
                topic: topic.to_string(),
                source,
            }
        })?;

        self.provision(topic)?;

        let record = Record::received_now(payload.value);
        let handler = format!("{}_handler", topic);
        let seq = self
            .store
            .put_with_token(
                payload.capability_token,
                payload.identity_token,
                topic,
                &handler,
                &record.to_bytes(),
            )
            .map_err(|source| BridgeError::StoreWrite {
                channel: topic.to_string(),
                source,
            })?;

        debug!(
            "Stored {} on {} as seq {} (id token {:?})",
            record, topic, seq, payload.identity_token
        );
        Ok(seq)
    }
}
