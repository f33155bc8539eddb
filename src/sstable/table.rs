//! Table file reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::MAX_KEY_SIZE;
use crate::error::Result;
use crate::record::{self, Record, TaggedKey};
use crate::storage::{OpenMode, Storage, StorageFile};

use super::parse_table_file_name;

/// Refill granularity for table iteration. Larger than any encoded record,
/// so at most one refill is needed to complete a partially buffered record.
const ITER_CHUNK_SIZE: u64 = 32 * 1024;

#[derive(Clone, Copy)]
struct BlockHandle {
    /// File offset one past the block's last record.
    end: u32,
    /// File offset of the block's first key in the index key region.
    key_offset: u32,
}

/// An open, immutable table file.
///
/// Tables are shared by reference across versions, snapshots, and running
/// iterators. When a published version stops referencing a table it is
/// marked evicted, and the drop of the final reference unlinks the file:
/// reference counting decides when, eviction decides whether.
pub struct SSTable {
    storage: Arc<dyn Storage>,
    file: Box<dyn StorageFile>,
    name: String,
    id: u64,
    blocks: Vec<BlockHandle>,
    /// File offset one past the final record; the index regions follow.
    records_end: u32,
    first: TaggedKey,
    last: TaggedKey,
    evict: AtomicBool,
}

impl SSTable {
    /// Open `sst.<id>` and parse its index. Structural violations are
    /// `Corruption` errors; a table that fails here is never installed.
    pub fn open(storage: Arc<dyn Storage>, name: &str) -> Result<Self> {
        let id = parse_table_file_name(name)
            .ok_or_else(|| crate::corruption!("malformed table file name {name:?}"))?;
        let file = storage.open(name, OpenMode::read())?;
        let len = file.len()?;
        if len < 8 + 2 * 8 {
            return Err(crate::corruption!(
                "table {name} is {len} bytes, too small to hold an index"
            ));
        }

        let mut footer = [0u8; 8];
        file.read_exact_at(len - 8, &mut footer)?;
        let index_offset = LittleEndian::read_u64(&footer);
        if index_offset >= len - 8 || (len - 8 - index_offset) % 8 != 0 {
            return Err(crate::corruption!(
                "table {name} has a bad index array offset {index_offset}"
            ));
        }

        let mut pairs_buf = vec![0u8; (len - 8 - index_offset) as usize];
        file.read_exact_at(index_offset, &mut pairs_buf)?;
        let entry_count = pairs_buf.len() / 8;
        if entry_count < 2 {
            return Err(crate::corruption!("table {name} has an empty block index"));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            entries.push(BlockHandle {
                end: LittleEndian::read_u32(&pairs_buf[i * 8..]),
                key_offset: LittleEndian::read_u32(&pairs_buf[i * 8 + 4..]),
            });
        }

        // The final entry is the file's last key, not a block.
        let last_entry = entries.pop().expect("entry count checked above");
        let blocks = entries;
        let records_end = blocks.last().expect("at least one block").end;
        if last_entry.end != records_end || blocks[0].key_offset != records_end {
            return Err(crate::corruption!(
                "table {name} index does not line up with its data region"
            ));
        }
        for pair in blocks.windows(2) {
            if pair[0].end >= pair[1].end || pair[0].key_offset >= pair[1].key_offset {
                return Err(crate::corruption!(
                    "table {name} block index is not strictly increasing"
                ));
            }
        }

        let first = read_index_key_at(file.as_ref(), blocks[0].key_offset, name)?;
        let last = read_index_key_at(file.as_ref(), last_entry.key_offset, name)?;
        if first > last {
            return Err(crate::corruption!(
                "table {name} first key sorts after its last key"
            ));
        }

        Ok(Self {
            storage,
            file,
            name: name.to_string(),
            id,
            blocks,
            records_end,
            first,
            last,
            evict: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn first_key(&self) -> &TaggedKey {
        &self.first
    }

    pub fn last_key(&self) -> &TaggedKey {
        &self.last
    }

    /// Mark the file for deletion when the last reference drops.
    pub fn mark_evict(&self) {
        self.evict.store(true, Ordering::SeqCst);
    }

    fn index_key(&self, block: usize) -> Result<TaggedKey> {
        read_index_key_at(self.file.as_ref(), self.blocks[block].key_offset, &self.name)
    }

    /// Index of the block whose first key is the greatest at or below `key`,
    /// or `None` when `key` precedes the whole table.
    fn find_block(&self, key: &TaggedKey) -> Result<Option<usize>> {
        let (mut l, mut r) = (0usize, self.blocks.len() - 1);
        while l + 1 < r {
            let m = (l + r) / 2;
            if self.index_key(m)? <= *key {
                l = m;
            } else {
                r = m;
            }
        }
        if self.index_key(r)? <= *key {
            Ok(Some(r))
        } else if self.index_key(l)? <= *key {
            Ok(Some(l))
        } else {
            Ok(None)
        }
    }

    fn block_range(&self, block: usize) -> (u32, u32) {
        let start = if block == 0 {
            0
        } else {
            self.blocks[block - 1].end
        };
        (start, self.blocks[block].end)
    }

    /// Find the record with the greatest tagged key at or below `key`,
    /// provided it belongs to the same user key.
    pub fn point_get(&self, key: &TaggedKey) -> Result<Option<Record>> {
        let block = match self.find_block(key)? {
            Some(block) => block,
            None => return Ok(None),
        };
        let (start, end) = self.block_range(block);
        let mut buf = vec![0u8; (end - start) as usize];
        self.file.read_exact_at(start as u64, &mut buf)?;

        let mut pos = 0;
        let mut candidate: Option<Record> = None;
        while pos < buf.len() {
            let record = record::decode_record(&buf, &mut pos).ok_or_else(|| {
                crate::corruption!("table {} block {} holds a truncated record", self.name, block)
            })?;
            if record.key <= *key {
                candidate = Some(record);
            } else {
                break;
            }
        }

        match candidate {
            Some(record) if record.key.user_key == key.user_key => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    /// Iterate records in key order, starting at the first record with
    /// tagged key >= `from` (or the start of the file). The iterator keeps
    /// the table alive.
    pub fn iter(self: Arc<Self>, from: Option<&TaggedKey>) -> Result<TableIterator> {
        let start = match from {
            None => 0,
            Some(key) => match self.find_block(key)? {
                // `key` precedes the table; nothing gets skipped anyway.
                None => 0,
                Some(block) => self.block_range(block).0,
            },
        };
        let end = self.records_end as u64;
        Ok(TableIterator {
            table: self,
            pos: start as u64,
            end,
            buf: Vec::new(),
            buf_start: start as u64,
            skip_below: from.cloned(),
            done: false,
        })
    }

    /// Greatest LSN in any record of the table. Full scan; used once per
    /// table when a store opens.
    pub fn max_lsn(self: Arc<Self>) -> Result<u64> {
        let mut max = 0;
        for record in self.iter(None)? {
            max = max.max(record?.key.lsn);
        }
        Ok(max)
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if self.evict.load(Ordering::SeqCst) {
            if let Err(err) = self.storage.unlink(&self.name) {
                tracing::warn!(table = %self.name, error = %err, "failed to remove evicted table file");
            }
        }
    }
}

fn read_index_key_at(file: &dyn StorageFile, offset: u32, name: &str) -> Result<TaggedKey> {
    let mut len_buf = [0u8; 4];
    file.read_exact_at(offset as u64, &mut len_buf)?;
    let key_len = LittleEndian::read_u32(&len_buf) as usize;
    if key_len == 0 || key_len > MAX_KEY_SIZE {
        return Err(crate::corruption!(
            "table {name} index key at offset {offset} has length {key_len}"
        ));
    }
    let mut buf = vec![0u8; key_len + 8];
    file.read_exact_at(offset as u64 + 4, &mut buf)?;
    let lsn = LittleEndian::read_u64(&buf[key_len..]);
    buf.truncate(key_len);
    Ok(TaggedKey {
        user_key: buf,
        lsn,
    })
}

/// Iterator over a table's record region, refilled in chunks. Holds a
/// reference to its table, so an evicted file outlives any open scan.
pub struct TableIterator {
    table: Arc<SSTable>,
    pos: u64,
    end: u64,
    buf: Vec<u8>,
    buf_start: u64,
    skip_below: Option<TaggedKey>,
    done: bool,
}

impl Iterator for TableIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.pos >= self.end {
                self.done = true;
                return None;
            }

            let rel = (self.pos - self.buf_start) as usize;
            let mut cursor = rel;
            let decoded = if rel < self.buf.len() {
                record::decode_record(&self.buf, &mut cursor)
            } else {
                None
            };

            let record = match decoded {
                Some(record) => {
                    self.pos += (cursor - rel) as u64;
                    record
                }
                None => {
                    // Refill from the current position; a record always fits
                    // in one chunk, so a second miss is structural damage.
                    let n = ITER_CHUNK_SIZE.min(self.end - self.pos) as usize;
                    self.buf.resize(n, 0);
                    if let Err(err) = self.table.file.read_exact_at(self.pos, &mut self.buf) {
                        self.done = true;
                        return Some(Err(err));
                    }
                    self.buf_start = self.pos;
                    let mut cursor = 0;
                    match record::decode_record(&self.buf, &mut cursor) {
                        Some(record) => {
                            self.pos += cursor as u64;
                            record
                        }
                        None => {
                            self.done = true;
                            return Some(Err(crate::corruption!(
                                "record extends past the data region in table {}",
                                self.table.name
                            )));
                        }
                    }
                }
            };

            if let Some(bound) = self.skip_below.take() {
                if record.key < bound {
                    self.skip_below = Some(bound);
                    continue;
                }
            }
            return Some(Ok(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::iterator::RecordIterator;
    use crate::record::TaggedValue;
    use crate::sstable::{table_file_name, TableBuilder};
    use crate::storage::MemStorage;

    fn record(key: &[u8], lsn: u64, value: &[u8]) -> Record {
        Record::new(TaggedKey::new(key, lsn), TaggedValue::live(value))
    }

    fn source(records: Vec<Record>) -> RecordIterator {
        Box::new(records.into_iter().map(Ok))
    }

    /// Build the records into one installed table and open it.
    fn build_table(
        storage: &Arc<MemStorage>,
        config: &EngineConfig,
        records: Vec<Record>,
        id: u64,
    ) -> Arc<SSTable> {
        let dyn_storage: Arc<dyn Storage> = Arc::clone(storage) as Arc<dyn Storage>;
        let mut builder =
            TableBuilder::new(vec![source(records)], Arc::clone(&dyn_storage), config)
                .expect("Failed to create builder");
        let tmp = builder.build().expect("build").expect("one table");
        assert_eq!(builder.build().expect("build"), None);

        let name = table_file_name(id);
        storage.rename(&tmp, &name).expect("Failed to install table");
        Arc::new(SSTable::open(dyn_storage, &name).expect("Failed to open table"))
    }

    fn sample_records(count: u32) -> Vec<Record> {
        (0..count)
            .map(|i| {
                record(
                    format!("key_{i:04}").as_bytes(),
                    i as u64 + 1,
                    format!("value_{i}").as_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_open_parses_bounds() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default();
        let table = build_table(&storage, &config, sample_records(10), 3);

        assert_eq!(table.id(), 3);
        assert_eq!(table.first_key(), &TaggedKey::new(*b"key_0000", 1));
        assert_eq!(table.last_key(), &TaggedKey::new(*b"key_0009", 10));
    }

    #[test]
    fn test_point_get() {
        let storage = Arc::new(MemStorage::new());
        // Small blocks force the index to matter.
        let config = EngineConfig::default().max_block_size(64);
        let table = build_table(&storage, &config, sample_records(100), 0);

        let hit = table
            .point_get(&TaggedKey::new(*b"key_0042", u64::MAX))
            .expect("get")
            .expect("present");
        assert_eq!(hit.value.value, b"value_42");
        assert_eq!(hit.key.lsn, 43);

        // A read view below the record's LSN does not see it.
        assert_eq!(
            table
                .point_get(&TaggedKey::new(*b"key_0042", 42))
                .expect("get"),
            None
        );

        // Absent keys, before, between, and after the key range.
        for missing in [&b"aaa"[..], b"key_0042x", b"zzz"] {
            assert_eq!(
                table
                    .point_get(&TaggedKey::new(missing, u64::MAX))
                    .expect("get"),
                None,
                "key {missing:?} must be absent"
            );
        }
    }

    #[test]
    fn test_iter_full() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default().max_block_size(64);
        let records = sample_records(100);
        let table = build_table(&storage, &config, records.clone(), 0);

        let scanned: Vec<Record> = Arc::clone(&table)
            .iter(None)
            .expect("iter")
            .map(|r| r.expect("record"))
            .collect();
        assert_eq!(scanned, records, "round-trip must be exact");
    }

    #[test]
    fn test_iter_from_bound() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default().max_block_size(64);
        let records = sample_records(100);
        let table = build_table(&storage, &config, records.clone(), 0);

        let from = TaggedKey::new(*b"key_0050", 0);
        let scanned: Vec<Record> = Arc::clone(&table)
            .iter(Some(&from))
            .expect("iter")
            .map(|r| r.expect("record"))
            .collect();
        assert_eq!(scanned, records[50..].to_vec());

        // A bound below the table scans everything.
        let from = TaggedKey::new(*b"aaa", 0);
        assert_eq!(Arc::clone(&table).iter(Some(&from)).expect("iter").count(), 100);

        // A bound above the table scans nothing.
        let from = TaggedKey::new(*b"zzz", 0);
        assert_eq!(Arc::clone(&table).iter(Some(&from)).expect("iter").count(), 0);
    }

    #[test]
    fn test_iter_from_mid_block() {
        // The bound lands inside a block: records below it in the same block
        // must be skipped, records at or above it kept.
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default();
        let records = sample_records(10);
        let table = build_table(&storage, &config, records.clone(), 0);

        let from = TaggedKey::new(*b"key_0007", 0);
        let scanned: Vec<Record> = Arc::clone(&table)
            .iter(Some(&from))
            .expect("iter")
            .map(|r| r.expect("record"))
            .collect();
        assert_eq!(scanned, records[7..].to_vec());
    }

    #[test]
    fn test_max_lsn() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default();
        let records = vec![
            record(b"a", 17, b"1"),
            record(b"b", 99, b"2"),
            record(b"c", 5, b"3"),
        ];
        let table = build_table(&storage, &config, records, 0);
        assert_eq!(Arc::clone(&table).max_lsn().expect("max lsn"), 99);
    }

    #[test]
    fn test_evicted_table_unlinks_on_drop() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default();
        let table = build_table(&storage, &config, sample_records(5), 7);
        let name = table.name().to_string();

        let iter = Arc::clone(&table).iter(None).expect("iter");
        table.mark_evict();
        drop(table);
        // A running iterator keeps the file alive.
        assert!(storage.exists(&name));

        assert_eq!(iter.count(), 5);
        assert!(!storage.exists(&name), "last reference unlinks the file");
    }

    #[test]
    fn test_unevicted_table_keeps_file() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default();
        let table = build_table(&storage, &config, sample_records(5), 7);
        let name = table.name().to_string();
        drop(table);
        assert!(storage.exists(&name));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let storage = Arc::new(MemStorage::new());
        let dyn_storage: Arc<dyn Storage> = Arc::clone(&storage) as Arc<dyn Storage>;

        let file = storage
            .open("sst.1", crate::storage::OpenMode::truncate())
            .expect("create");
        file.append(b"not a table").expect("write");
        assert!(matches!(
            SSTable::open(Arc::clone(&dyn_storage), "sst.1"),
            Err(crate::error::Error::Corruption(_))
        ));

        assert!(SSTable::open(dyn_storage, "sst.nonnumeric").is_err());
    }
}
