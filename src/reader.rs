//! Offline reader for a channel's records

use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use tracing::debug;

use crate::bridge::Record;
use crate::store::RecordStore;

/// Prints `log size <n>` followed by one `<seq>: <value> - start: <timestamp>` line per record
///
/// Returns the number of records printed. Stops at the first record that cannot be
/// fetched or decoded.
pub fn read_log<S, W>(store: &mut S, channel: &str, out: &mut W) -> Result<u64>
where
    S: RecordStore + ?Sized,
    W: Write,
{
    store
        .open_channel(channel)
        .map_err(|e| eyre!("Failed to open channel {}: {}", channel, e))?;
    let latest = store
        .get_latest_sequence(channel)
        .map_err(|e| eyre!("Failed to get latest sequence of {}: {}", channel, e))?;
    debug!("Channel {} holds {} records", channel, latest);

    writeln!(out, "log size {}", latest)?;
    for seq in 1..=latest {
        let stored = store
            .get(channel, seq)
            .map_err(|e| eyre!("Failed to get record {} of {}: {}", seq, channel, e))?;
        let record = Record::from_bytes(&stored.data).ok_or_else(|| {
            eyre!(
                "Record {} of {} holds {} bytes, too short to decode",
                seq,
                channel,
                stored.data.len()
            )
        })?;
        writeln!(out, "{}: {}", seq, record)?;
    }
    out.flush()?;
    Ok(latest)
}
