use chrono::{DateTime, Utc};
use std::fmt;

/// Encoded size of a [`Record`] in bytes
pub const RECORD_SIZE: usize = 16;

/// One timestamped value as written to a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub value: i64,
    /// Milliseconds since the Unix epoch, with sub-millisecond precision
    pub receipt_timestamp: f64,
}

impl Record {
    pub fn new(value: i64, received_at: DateTime<Utc>) -> Self {
        Record {
            value,
            receipt_timestamp: millis_since_epoch(received_at),
        }
    }

    /// Stamps `value` with the current wall-clock time
    pub fn received_now(value: i64) -> Self {
        Self::new(value, Utc::now())
    }

    /// Fixed little-endian layout: value, then timestamp
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[..8].copy_from_slice(&self.value.to_le_bytes());
        buf[8..].copy_from_slice(&self.receipt_timestamp.to_le_bytes());
        buf
    }

    /// Returns `None` when `bytes` is shorter than [`RECORD_SIZE`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let value = bytes.get(..8)?.try_into().ok()?;
        let timestamp = bytes.get(8..RECORD_SIZE)?.try_into().ok()?;
        Some(Record {
            value: i64::from_le_bytes(value),
            receipt_timestamp: f64::from_le_bytes(timestamp),
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - start: {:.6}", self.value, self.receipt_timestamp)
    }
}

pub fn millis_since_epoch(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1000.0
}
