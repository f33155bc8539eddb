//! Write-ahead log manager.
//!
//! Two log files live in the store directory: `mem.log` receives every write
//! to the mutable memtable, and `imm.log` exists only while a frozen memtable
//! is waiting to be flushed. Rotation renames the former to the latter.
//!
//! # Record framing
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | record payload   |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! The payload is the standard record encoding from [`crate::record`]. The
//! checksum covers the payload. Recovery reads records until the file ends or
//! a record fails to frame, length-check, or checksum: everything after the
//! first bad record is a torn tail from a crash and is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::config::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::error::{Error, Result};
use crate::record::{self, Record};
use crate::storage::{OpenMode, Storage, StorageFile};

pub const MEM_LOG: &str = "mem.log";
pub const IMM_LOG: &str = "imm.log";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Upper bound on a framed record, used to reject garbage lengths during
/// recovery without attempting a huge allocation.
const MAX_PAYLOAD_SIZE: usize = MAX_KEY_SIZE + MAX_VALUE_SIZE + 64;

/// Manages the two write-ahead logs for the memtable pair.
///
/// Appends take the state lock shared; the file append itself is the
/// serialization point between concurrent writers. Rotation takes it
/// exclusively, and the engine additionally fences writers by holding the
/// memtable-pair lock across freeze + rotate so no append can land in the
/// outgoing file.
pub struct LogManager {
    storage: Arc<dyn Storage>,
    state: RwLock<LogState>,
    size: AtomicU64,
}

struct LogState {
    file: Box<dyn StorageFile>,
}

impl LogManager {
    /// Parse both log files (tolerating a missing `imm.log`), then open
    /// `mem.log` for append. Returns the manager plus the recovered record
    /// sequences, immutable log first.
    pub fn recover(storage: Arc<dyn Storage>) -> Result<(Self, Vec<Record>, Vec<Record>)> {
        let imm_records = if storage.exists(IMM_LOG) {
            parse_log(storage.as_ref(), IMM_LOG)?
        } else {
            Vec::new()
        };
        let mem_records = if storage.exists(MEM_LOG) {
            parse_log(storage.as_ref(), MEM_LOG)?
        } else {
            Vec::new()
        };

        let file = storage.open(MEM_LOG, OpenMode::append())?;
        let size = file.len()?;

        tracing::debug!(
            imm_records = imm_records.len(),
            mem_records = mem_records.len(),
            log_size = size,
            "recovered write-ahead logs"
        );

        let manager = Self {
            storage,
            state: RwLock::new(LogState { file }),
            size: AtomicU64::new(size),
        };
        Ok((manager, imm_records, mem_records))
    }

    /// Append one record to `mem.log`.
    pub fn append(&self, record: &Record) -> Result<()> {
        let mut payload = Vec::with_capacity(record.encoded_len());
        record::encode_record(&mut payload, record);

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame
            .write_u32::<LittleEndian>(payload.len() as u32)
            .expect("vec write is infallible");
        frame.extend_from_slice(&payload);
        frame
            .write_u32::<LittleEndian>(CRC32.checksum(&payload))
            .expect("vec write is infallible");

        let state = self.state.read()?;
        state.file.append(&frame)?;
        self.size.fetch_add(frame.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Bytes appended to `mem.log` since it was created or last rotated.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Make every appended record crash-durable.
    pub fn sync(&self) -> Result<()> {
        self.state.read()?.file.sync()
    }

    /// Rename `mem.log` to `imm.log` and start a fresh `mem.log`.
    ///
    /// The outgoing file is synced before the rename so `imm.log` is always
    /// durable. Fails if a previous `imm.log` still exists: its flush has
    /// not completed and rotating again would drop it.
    pub fn rotate(&self) -> Result<()> {
        let mut state = self.state.write()?;
        state.file.sync()?;
        if self.storage.exists(IMM_LOG) {
            return Err(Error::Internal(
                "log rotation attempted while a flush is still pending".to_string(),
            ));
        }
        self.storage.rename(MEM_LOG, IMM_LOG)?;
        state.file = self.storage.open(MEM_LOG, OpenMode::append())?;
        self.size.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Remove `imm.log` after its contents have been installed as tables.
    pub fn drop_imm(&self) -> Result<()> {
        self.storage.unlink(IMM_LOG)
    }
}

/// Read every complete record from a log file, stopping at the first torn or
/// corrupt frame.
fn parse_log(storage: &dyn Storage, name: &str) -> Result<Vec<Record>> {
    let file = storage.open(name, OpenMode::read())?;
    let len = file.len()? as usize;
    let mut buf = vec![0u8; len];
    file.read_exact_at(0, &mut buf)?;

    let mut records = Vec::new();
    let mut pos = 0;
    while pos + 4 <= len {
        let payload_len = LittleEndian::read_u32(&buf[pos..]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE || pos + 4 + payload_len + 4 > len {
            break;
        }
        let payload = &buf[pos + 4..pos + 4 + payload_len];
        let stored_crc = LittleEndian::read_u32(&buf[pos + 4 + payload_len..]);
        if CRC32.checksum(payload) != stored_crc {
            break;
        }

        let mut payload_pos = 0;
        match record::decode_record(payload, &mut payload_pos) {
            Some(record) if payload_pos == payload_len => records.push(record),
            _ => break,
        }
        pos += 4 + payload_len + 4;
    }

    if pos != len {
        tracing::warn!(
            log = name,
            recovered = records.len(),
            discarded_bytes = len - pos,
            "discarding torn tail of write-ahead log"
        );
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{TaggedKey, TaggedValue};
    use crate::storage::MemStorage;

    fn record(key: &[u8], lsn: u64, value: &[u8]) -> Record {
        Record::new(TaggedKey::new(key, lsn), TaggedValue::live(value))
    }

    fn recover(storage: &Arc<MemStorage>) -> (LogManager, Vec<Record>, Vec<Record>) {
        let storage: Arc<dyn Storage> = Arc::clone(storage) as Arc<dyn Storage>;
        LogManager::recover(storage).expect("Failed to recover log manager")
    }

    #[test]
    fn test_append_and_recover() {
        let storage = Arc::new(MemStorage::new());
        let (log, imm, mem) = recover(&storage);
        assert!(imm.is_empty());
        assert!(mem.is_empty());

        log.append(&record(b"key1", 1, b"value1"))
            .expect("Failed to append");
        log.append(&record(b"key2", 2, b"value2"))
            .expect("Failed to append");
        assert!(log.size() > 0);
        drop(log);

        let (_, imm, mem) = recover(&storage);
        assert!(imm.is_empty());
        assert_eq!(mem.len(), 2);
        assert_eq!(mem[0], record(b"key1", 1, b"value1"));
        assert_eq!(mem[1], record(b"key2", 2, b"value2"));
    }

    #[test]
    fn test_recover_discards_torn_tail() {
        let storage = Arc::new(MemStorage::new());
        let (log, _, _) = recover(&storage);
        log.append(&record(b"key1", 1, b"value1"))
            .expect("Failed to append");
        drop(log);

        // Simulate a crash mid-append: a frame header with no payload.
        let file = storage
            .open(MEM_LOG, OpenMode::append())
            .expect("Failed to open log");
        file.append(&[9, 0, 0, 0, 1, 2]).expect("Failed to append");

        let (_, _, mem) = recover(&storage);
        assert_eq!(mem.len(), 1);
        assert_eq!(mem[0], record(b"key1", 1, b"value1"));
    }

    #[test]
    fn test_recover_discards_bad_checksum() {
        let storage = Arc::new(MemStorage::new());
        let (log, _, _) = recover(&storage);
        log.append(&record(b"key1", 1, b"value1"))
            .expect("Failed to append");
        drop(log);

        // A complete frame with a wrong checksum, then a valid-looking frame
        // after it. Both must be discarded: the log is only trusted up to the
        // first bad record.
        let mut payload = Vec::new();
        crate::record::encode_record(&mut payload, &record(b"key2", 2, b"value2"));
        let file = storage
            .open(MEM_LOG, OpenMode::append())
            .expect("Failed to open log");
        let mut frame = Vec::new();
        frame
            .write_u32::<LittleEndian>(payload.len() as u32)
            .unwrap();
        frame.extend_from_slice(&payload);
        frame.write_u32::<LittleEndian>(0xdeadbeef).unwrap();
        file.append(&frame).expect("Failed to append");

        let (_, _, mem) = recover(&storage);
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_rotate() {
        let storage = Arc::new(MemStorage::new());
        let (log, _, _) = recover(&storage);

        log.append(&record(b"old", 1, b"1")).expect("append");
        log.rotate().expect("Failed to rotate");
        assert_eq!(log.size(), 0);
        log.append(&record(b"new", 2, b"2")).expect("append");

        let (_, imm, mem) = recover(&storage);
        assert_eq!(imm, vec![record(b"old", 1, b"1")]);
        assert_eq!(mem, vec![record(b"new", 2, b"2")]);
    }

    #[test]
    fn test_rotate_blocked_by_pending_imm() {
        let storage = Arc::new(MemStorage::new());
        let (log, _, _) = recover(&storage);

        log.append(&record(b"a", 1, b"1")).expect("append");
        log.rotate().expect("Failed to rotate");
        log.append(&record(b"b", 2, b"2")).expect("append");

        assert!(matches!(log.rotate(), Err(Error::Internal(_))));

        log.drop_imm().expect("Failed to drop imm log");
        log.rotate().expect("rotate after drop_imm");

        let (_, imm, mem) = recover(&storage);
        assert_eq!(imm, vec![record(b"b", 2, b"2")]);
        assert!(mem.is_empty());
    }

    #[test]
    fn test_unsynced_writes_lost_on_crash() {
        let storage = Arc::new(MemStorage::new());
        let (log, _, _) = recover(&storage);

        log.append(&record(b"key1", 1, b"1")).expect("append");
        log.sync().expect("Failed to sync");
        log.append(&record(b"key2", 2, b"2")).expect("append");
        drop(log);

        storage.crash();

        let (_, _, mem) = recover(&storage);
        assert_eq!(mem, vec![record(b"key1", 1, b"1")]);
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let storage = Arc::new(MemStorage::new());
        let (log, _, _) = recover(&storage);

        let tombstone = Record::new(TaggedKey::new(*b"key", 3), TaggedValue::tombstone());
        log.append(&tombstone).expect("Failed to append");
        drop(log);

        let (_, _, mem) = recover(&storage);
        assert_eq!(mem, vec![tombstone]);
    }
}
