//! File-backed record store
//!
//! Each channel is one JSON-lines file under the store root. Line `n` holds the record
//! with sequence number `n` together with the channel name; an in-memory index of line
//! offsets gives direct access by sequence number. Reopening a channel for writing
//! rebuilds the index, cuts off an entry left incomplete by an interrupted append, and
//! numbering resumes after the last complete line.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{check_record_size, check_sequence, RecordStore, StoreError, StoredRecord};

const LOG_EXTENSION: &str = "log";
/// Longest escaped channel name used as a file stem as is
const MAX_STEM_LEN: usize = 200;
/// Digest bytes appended to a shortened file stem
const STEM_DIGEST_LEN: usize = 8;

/// One line of a channel log
#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    channel: String,
    #[serde(flatten)]
    record: StoredRecord,
}

#[derive(Debug)]
struct ChannelLog {
    path: PathBuf,
    file: File,
    record_size: usize,
    /// Attached with `open_channel`, never appended to
    read_only: bool,
    /// Byte offset of every line, indexed by `seq - 1`
    offsets: Vec<u64>,
    end: u64,
}

#[derive(Debug)]
pub struct FileRecordStore {
    root: PathBuf,
    initialized: bool,
    channels: HashMap<String, ChannelLog>,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            initialized: false,
            channels: HashMap::new(),
        }
    }

    pub fn channel_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", file_stem(name), LOG_EXTENSION))
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.initialized {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    fn channel(&self, name: &str) -> Result<&ChannelLog, StoreError> {
        self.ensure_initialized()?;
        self.channels
            .get(name)
            .ok_or_else(|| StoreError::UnknownChannel(name.to_string()))
    }

    fn attach(
        &mut self,
        name: &str,
        record_size: usize,
        capacity_hint: usize,
        read_only: bool,
    ) -> Result<(), StoreError> {
        let path = self.channel_path(name);
        let file = if read_only {
            File::open(&path)
        } else {
            OpenOptions::new()
                .create(true)
                .append(true)
                .read(true)
                .open(&path)
        }
        .map_err(|source| io_error(&path, source))?;

        let mut offsets = Vec::with_capacity(capacity_hint.min(1 << 16));
        let end = index_lines(&path, name, &file, &mut offsets, !read_only)?;
        info!(
            "Opened channel {} at {} with {} records",
            name,
            path.display(),
            offsets.len()
        );

        self.channels.insert(
            name.to_string(),
            ChannelLog {
                path,
                file,
                record_size,
                read_only,
                offsets,
                end,
            },
        );
        Ok(())
    }
}

impl RecordStore for FileRecordStore {
    fn init(&mut self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| io_error(&self.root, source))?;
        self.initialized = true;
        debug!("File record store initialized at {}", self.root.display());
        Ok(())
    }

    fn create_channel(
        &mut self,
        name: &str,
        record_size: usize,
        capacity_hint: usize,
    ) -> Result<(), StoreError> {
        self.ensure_initialized()?;
        if let Some(existing) = self.channels.get(name).filter(|log| !log.read_only) {
            if existing.record_size != record_size {
                return Err(StoreError::ChannelConflict {
                    channel: name.to_string(),
                    existing: existing.record_size,
                    requested: record_size,
                });
            }
            return Ok(());
        }
        self.attach(name, record_size, capacity_hint, false)
    }

    fn open_channel(&mut self, name: &str) -> Result<(), StoreError> {
        self.ensure_initialized()?;
        if self.channels.contains_key(name) {
            return Ok(());
        }
        if !self.channel_path(name).is_file() {
            return Err(StoreError::UnknownChannel(name.to_string()));
        }
        self.attach(name, 0, 0, true)
    }

    fn put_with_token(
        &mut self,
        capability_token: &str,
        identity_token: &str,
        channel: &str,
        handler: &str,
        data: &[u8],
    ) -> Result<u64, StoreError> {
        self.ensure_initialized()?;
        let log = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| StoreError::UnknownChannel(channel.to_string()))?;
        if log.read_only {
            return Err(StoreError::Rejected(format!(
                "channel {:?} is open for reading only",
                channel
            )));
        }
        check_record_size(channel, data.len(), log.record_size)?;

        let seq = log.offsets.len() as u64 + 1;
        let entry = LogLine {
            channel: channel.to_string(),
            record: StoredRecord {
                seq,
                handler: handler.to_string(),
                capability_token: capability_token.to_string(),
                identity_token: identity_token.to_string(),
                data: data.to_vec(),
            },
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| StoreError::Corrupt {
            path: log.path.clone(),
            line: seq as usize,
            reason: e.to_string(),
        })?;
        line.push('\n');

        if let Err(source) = log.file.write_all(line.as_bytes()) {
            // Whatever part of the line reached the file would corrupt the next append.
            if let Err(e) = log.file.set_len(log.end) {
                warn!(
                    "Unable to roll back partial write to {}: {}",
                    log.path.display(),
                    e
                );
            }
            return Err(io_error(&log.path, source));
        }

        log.offsets.push(log.end);
        log.end += line.len() as u64;
        Ok(seq)
    }

    fn get_latest_sequence(&self, channel: &str) -> Result<u64, StoreError> {
        Ok(self.channel(channel)?.offsets.len() as u64)
    }

    fn get(&self, channel: &str, seq: u64) -> Result<StoredRecord, StoreError> {
        let log = self.channel(channel)?;
        check_sequence(channel, seq, log.offsets.len() as u64)?;

        let mut file = File::open(&log.path).map_err(|source| io_error(&log.path, source))?;
        file.seek(SeekFrom::Start(log.offsets[(seq - 1) as usize]))
            .map_err(|source| io_error(&log.path, source))?;

        let mut line = String::new();
        BufReader::new(file)
            .read_line(&mut line)
            .map_err(|source| io_error(&log.path, source))?;
        parse_line(&log.path, seq as usize, &line).map(|entry| entry.record)
    }
}

/// Records the offset of every complete line in `file` and returns the end offset
///
/// An unterminated last line is the remains of an interrupted append. With
/// `repair_tail` it is cut off the file, otherwise it is only left out of the index.
fn index_lines(
    path: &Path,
    channel: &str,
    file: &File,
    offsets: &mut Vec<u64>,
    repair_tail: bool,
) -> Result<u64, StoreError> {
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|source| io_error(path, source))?;

    let mut offset = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|source| io_error(path, source))?;
        if read == 0 {
            break;
        }

        let line_no = offsets.len() + 1;
        if !line.ends_with('\n') {
            if repair_tail {
                warn!(
                    "Dropping incomplete entry at line {} of {} ({} bytes)",
                    line_no,
                    path.display(),
                    read
                );
                file.set_len(offset)
                    .map_err(|source| io_error(path, source))?;
            } else {
                warn!(
                    "Ignoring incomplete entry at line {} of {}",
                    line_no,
                    path.display()
                );
            }
            break;
        }

        let entry = parse_line(path, line_no, &line)?;
        if entry.channel != channel {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("entry belongs to channel {:?}", entry.channel),
            });
        }
        if entry.record.seq != line_no as u64 {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("expected sequence {}, found {}", line_no, entry.record.seq),
            });
        }

        offsets.push(offset);
        offset += read as u64;
    }
    Ok(offset)
}

fn parse_line(path: &Path, line_no: usize, line: &str) -> Result<LogLine, StoreError> {
    serde_json::from_str(line.trim_end()).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        line: line_no,
        reason: e.to_string(),
    })
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Maps a channel name (usually an MQTT topic) to a file name stem
///
/// ASCII alphanumerics, `-` and `_` pass through, everything else becomes `%XX`.
pub fn escape_channel_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => escaped.push(byte as char),
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

/// Escaped name, shortened to a prefix plus a digest of the full name when too long
///
/// `~` never comes out of [`escape_channel_name`], so shortened stems cannot clash
/// with plain ones.
fn file_stem(name: &str) -> String {
    let escaped = escape_channel_name(name);
    if escaped.len() <= MAX_STEM_LEN {
        return escaped;
    }
    let digest = Sha256::digest(name.as_bytes());
    format!(
        "{}~{}",
        &escaped[..MAX_STEM_LEN],
        hex::encode(&digest[..STEM_DIGEST_LEN])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> FileRecordStore {
        let mut store = FileRecordStore::new(dir);
        store.init().unwrap();
        store
    }

    #[test]
    fn escapes_topic_separators() {
        assert_eq!(escape_channel_name("general"), "general");
        assert_eq!(escape_channel_name("data/room-1"), "data%2Froom-1");
        assert_eq!(escape_channel_name("a.b"), "a%2Eb");
        assert_eq!(escape_channel_name("#"), "%23");
    }

    #[test]
    fn init_creates_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("store");
        let mut store = FileRecordStore::new(&root);
        store.init().unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn appends_and_reads_back_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.create_channel("general", 16, 10).unwrap();

        let first = store
            .put_with_token("tok1", "id1", "general", "general_handler", &[1, 2, 3])
            .unwrap();
        let second = store
            .put_with_token("tok2", "id2", "general", "general_handler", &[4])
            .unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(store.get_latest_sequence("general").unwrap(), 2);

        let record = store.get("general", 1).unwrap();
        assert_eq!(record.data, vec![1, 2, 3]);
        assert_eq!(record.capability_token, "tok1");
        assert_eq!(record.identity_token, "id1");

        let record = store.get("general", 2).unwrap();
        assert_eq!(record.data, vec![4]);
        assert_eq!(record.handler, "general_handler");
    }

    #[test]
    fn numbering_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_store(dir.path());
            store.create_channel("data/room", 16, 10).unwrap();
            store.put_with_token("c", "i", "data/room", "h", &[1]).unwrap();
            store.put_with_token("c", "i", "data/room", "h", &[2]).unwrap();
        }

        let mut store = open_store(dir.path());
        store.create_channel("data/room", 16, 10).unwrap();
        assert_eq!(store.get_latest_sequence("data/room").unwrap(), 2);
        assert_eq!(store.put_with_token("c", "i", "data/room", "h", &[3]).unwrap(), 3);
        assert_eq!(store.get("data/room", 3).unwrap().data, vec![3]);
    }

    #[test]
    fn open_channel_requires_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        assert!(matches!(
            store.open_channel("missing"),
            Err(StoreError::UnknownChannel(_))
        ));

        store.create_channel("present", 16, 0).unwrap();
        store.put_with_token("c", "i", "present", "h", &[9]).unwrap();

        let mut reader = open_store(dir.path());
        reader.open_channel("present").unwrap();
        assert_eq!(reader.get_latest_sequence("present").unwrap(), 1);
        assert_eq!(reader.get("present", 1).unwrap().data, vec![9]);
    }

    #[test]
    fn oversized_record_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.create_channel("general", 4, 0).unwrap();
        let err = store
            .put_with_token("c", "i", "general", "h", &[0u8; 5])
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordTooLarge { .. }));
        assert_eq!(store.get_latest_sequence("general").unwrap(), 0);
        assert_eq!(fs::read_to_string(store.channel_path("general")).unwrap(), "");
    }

    #[test]
    fn corrupt_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        fs::write(store.channel_path("broken"), "not json\n").unwrap();
        assert!(matches!(
            store.create_channel("broken", 16, 0),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn get_out_of_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.create_channel("general", 16, 0).unwrap();
        assert!(matches!(
            store.get("general", 0),
            Err(StoreError::SequenceOutOfRange { .. })
        ));
        assert!(matches!(
            store.get("general", 1),
            Err(StoreError::SequenceOutOfRange { .. })
        ));
    }

    #[test]
    fn incomplete_last_entry_is_cut_off_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut store = open_store(dir.path());
            store.create_channel("general", 16, 0).unwrap();
            store.put_with_token("c", "i", "general", "h", &[1]).unwrap();
            store.channel_path("general")
        };
        let intact_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"channel":"general","seq":2,"handler":"gen"#).unwrap();
        drop(file);

        let mut store = open_store(dir.path());
        store.create_channel("general", 16, 0).unwrap();
        assert_eq!(store.get_latest_sequence("general").unwrap(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        assert_eq!(store.put_with_token("c", "i", "general", "h", &[2]).unwrap(), 2);
        assert_eq!(store.get("general", 2).unwrap().data, vec![2]);

        let mut reopened = open_store(dir.path());
        reopened.create_channel("general", 16, 0).unwrap();
        assert_eq!(reopened.get_latest_sequence("general").unwrap(), 2);
    }

    #[test]
    fn reader_skips_incomplete_last_entry_without_touching_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_store(dir.path());
        writer.create_channel("general", 16, 0).unwrap();
        writer.put_with_token("c", "i", "general", "h", &[1]).unwrap();
        let path = writer.channel_path("general");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"channel":"gen"#).unwrap();
        drop(file);
        let len = fs::metadata(&path).unwrap().len();

        let mut reader = open_store(dir.path());
        reader.open_channel("general").unwrap();
        assert_eq!(reader.get_latest_sequence("general").unwrap(), 1);
        assert_eq!(reader.get("general", 1).unwrap().data, vec![1]);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        assert!(matches!(
            reader.put_with_token("c", "i", "general", "h", &[2]),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn damaged_entry_before_the_end_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.create_channel("general", 16, 0).unwrap();
        store.put_with_token("c", "i", "general", "h", &[1]).unwrap();
        let path = store.channel_path("general");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"channel\":\"general\",\"seq\":2,\"handler\":\"gen\n")
            .unwrap();
        drop(file);

        let mut reopened = open_store(dir.path());
        assert!(matches!(
            reopened.create_channel("general", 16, 0),
            Err(StoreError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn long_channel_names_get_bounded_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let topic = "sensors/".repeat(40);
        assert_eq!(topic.len(), 320);

        let mut store = open_store(dir.path());
        store.create_channel(&topic, 16, 0).unwrap();
        store.put_with_token("c", "i", &topic, "h", &[7]).unwrap();

        let path = store.channel_path(&topic);
        let file_name = path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.len() <= 255, "{} bytes", file_name.len());
        assert!(path.is_file());

        let mut reader = open_store(dir.path());
        reader.open_channel(&topic).unwrap();
        assert_eq!(reader.get(&topic, 1).unwrap().data, vec![7]);
    }

    #[test]
    fn long_names_sharing_a_prefix_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let first = format!("{}a", "room/".repeat(60));
        let second = format!("{}b", "room/".repeat(60));

        let mut store = open_store(dir.path());
        assert_ne!(store.channel_path(&first), store.channel_path(&second));
        store.create_channel(&first, 16, 0).unwrap();
        store.create_channel(&second, 16, 0).unwrap();
        store.put_with_token("c", "i", &first, "h", &[1]).unwrap();
        assert_eq!(store.get_latest_sequence(&second).unwrap(), 0);
    }

    #[test]
    fn log_of_another_channel_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.create_channel("kitchen", 16, 0).unwrap();
        store.put_with_token("c", "i", "kitchen", "h", &[1]).unwrap();
        fs::copy(store.channel_path("kitchen"), store.channel_path("garage")).unwrap();

        assert!(matches!(
            store.create_channel("garage", 16, 0),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }
}
