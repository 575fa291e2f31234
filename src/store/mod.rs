//! # Sequential Record Store
//!
//! Append-only channels of fixed-size records. Every successful write is assigned the
//! next sequence number of its channel, starting at 1, so the order of records in a
//! channel is the order in which they were written.
//!
//! ```text
//! store/
//! ├── file.rs    - JSON-lines log per channel on disk
//! └── memory.rs  - same contract, held in memory
//! ```
//!
//! Writers pass a capability token and an identity token with each record. Both are
//! kept alongside the record so readers can tell which device produced it.

pub mod file;
pub mod memory;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store used before init()")]
    NotInitialized,

    #[error("channel {0:?} does not exist")]
    UnknownChannel(String),

    #[error("channel {channel:?} already exists with record size {existing}, requested {requested}")]
    ChannelConflict {
        channel: String,
        existing: usize,
        requested: usize,
    },

    #[error("record of {size} bytes exceeds channel {channel:?} limit of {limit}")]
    RecordTooLarge {
        channel: String,
        size: usize,
        limit: usize,
    },

    #[error("sequence {seq} is outside channel {channel:?} (latest is {latest})")]
    SequenceOutOfRange {
        channel: String,
        seq: u64,
        latest: u64,
    },

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt entry in {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// A record as held by the store, together with the write metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub seq: u64,
    pub handler: String,
    #[serde(rename = "cap_token")]
    pub capability_token: String,
    #[serde(rename = "id_token")]
    pub identity_token: String,
    pub data: Vec<u8>,
}

/// Backend-neutral access to a sequential record store
///
/// `init` must run once before any other call. Channels are provisioned with
/// `create_channel` (idempotent) before they are written, or attached with
/// `open_channel` when they are only read.
pub trait RecordStore {
    fn init(&mut self) -> Result<(), StoreError>;

    fn create_channel(
        &mut self,
        name: &str,
        record_size: usize,
        capacity_hint: usize,
    ) -> Result<(), StoreError>;

    /// Attaches an existing channel; fails with [`StoreError::UnknownChannel`] if there is none
    fn open_channel(&mut self, name: &str) -> Result<(), StoreError>;

    /// Appends one record and returns the sequence number assigned to it
    fn put_with_token(
        &mut self,
        capability_token: &str,
        identity_token: &str,
        channel: &str,
        handler: &str,
        data: &[u8],
    ) -> Result<u64, StoreError>;

    /// Highest sequence number written so far, 0 for an empty channel
    fn get_latest_sequence(&self, channel: &str) -> Result<u64, StoreError>;

    fn get(&self, channel: &str, seq: u64) -> Result<StoredRecord, StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for Box<S> {
    fn init(&mut self) -> Result<(), StoreError> {
        (**self).init()
    }

    fn create_channel(
        &mut self,
        name: &str,
        record_size: usize,
        capacity_hint: usize,
    ) -> Result<(), StoreError> {
        (**self).create_channel(name, record_size, capacity_hint)
    }

    fn open_channel(&mut self, name: &str) -> Result<(), StoreError> {
        (**self).open_channel(name)
    }

    fn put_with_token(
        &mut self,
        capability_token: &str,
        identity_token: &str,
        channel: &str,
        handler: &str,
        data: &[u8],
    ) -> Result<u64, StoreError> {
        (**self).put_with_token(capability_token, identity_token, channel, handler, data)
    }

    fn get_latest_sequence(&self, channel: &str) -> Result<u64, StoreError> {
        (**self).get_latest_sequence(channel)
    }

    fn get(&self, channel: &str, seq: u64) -> Result<StoredRecord, StoreError> {
        (**self).get(channel, seq)
    }
}

/// Rejects `seq` values outside `1..=latest`
pub(crate) fn check_sequence(channel: &str, seq: u64, latest: u64) -> Result<(), StoreError> {
    if seq == 0 || seq > latest {
        return Err(StoreError::SequenceOutOfRange {
            channel: channel.to_string(),
            seq,
            latest,
        });
    }
    Ok(())
}

pub(crate) fn check_record_size(channel: &str, size: usize, limit: usize) -> Result<(), StoreError> {
    if size > limit {
        return Err(StoreError::RecordTooLarge {
            channel: channel.to_string(),
            size,
            limit,
        });
    }
    Ok(())
}
