use std::collections::HashMap;
use tracing::debug;

use super::{check_record_size, check_sequence, RecordStore, StoreError, StoredRecord};

#[derive(Debug)]
struct MemoryChannel {
    record_size: usize,
    records: Vec<StoredRecord>,
}

/// In-process record store; contents are lost when it is dropped
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    initialized: bool,
    channels: HashMap<String, MemoryChannel>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> Result<&MemoryChannel, StoreError> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        self.channels
            .get(name)
            .ok_or_else(|| StoreError::UnknownChannel(name.to_string()))
    }
}

impl RecordStore for MemoryRecordStore {
    fn init(&mut self) -> Result<(), StoreError> {
        self.initialized = true;
        Ok(())
    }

    fn create_channel(
        &mut self,
        name: &str,
        record_size: usize,
        capacity_hint: usize,
    ) -> Result<(), StoreError> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        if let Some(existing) = self.channels.get(name) {
            if existing.record_size != record_size {
                return Err(StoreError::ChannelConflict {
                    channel: name.to_string(),
                    existing: existing.record_size,
                    requested: record_size,
                });
            }
            return Ok(());
        }

        debug!("Creating in-memory channel {}", name);
        self.channels.insert(
            name.to_string(),
            MemoryChannel {
                record_size,
                records: Vec::with_capacity(capacity_hint.min(4096)),
            },
        );
        Ok(())
    }

    fn open_channel(&mut self, name: &str) -> Result<(), StoreError> {
        self.channel(name).map(|_| ())
    }

    fn put_with_token(
        &mut self,
        capability_token: &str,
        identity_token: &str,
        channel: &str,
        handler: &str,
        data: &[u8],
    ) -> Result<u64, StoreError> {
        let limit = self.channel(channel)?.record_size;
        check_record_size(channel, data.len(), limit)?;

        let log = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| StoreError::UnknownChannel(channel.to_string()))?;
        let seq = log.records.len() as u64 + 1;
        log.records.push(StoredRecord {
            seq,
            handler: handler.to_string(),
            capability_token: capability_token.to_string(),
            identity_token: identity_token.to_string(),
            data: data.to_vec(),
        });
        Ok(seq)
    }

    fn get_latest_sequence(&self, channel: &str) -> Result<u64, StoreError> {
        Ok(self.channel(channel)?.records.len() as u64)
    }

    fn get(&self, channel: &str, seq: u64) -> Result<StoredRecord, StoreError> {
        let log = self.channel(channel)?;
        check_sequence(channel, seq, log.records.len() as u64)?;
        Ok(log.records[(seq - 1) as usize].clone())
    }
}
