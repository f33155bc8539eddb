//! Streams merged records into table files.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::iterator::{MergeIterator, RecordIterator};
use crate::record::{self, Record, TaggedKey};
use crate::storage::{OpenMode, Storage};

use super::TEMP_PREFIX;

/// Process-wide counter for temp file names. Leftovers from a crashed
/// process are swept when the store opens, before any builder runs.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_temp_name() -> String {
    format!("{TEMP_PREFIX}{}", TEMP_SEQ.fetch_add(1, Ordering::SeqCst))
}

/// Consumes one ordered record stream and emits table files: each `build()`
/// call writes one table into a fresh temp file and returns its name, `None`
/// once the stream is drained. A table closes on the first block boundary at
/// or past the table target, so a record is never split across files.
pub struct TableBuilder {
    source: RecordIterator,
    peeked: Option<Record>,
    storage: Arc<dyn Storage>,
    block_size: usize,
    table_size: usize,
}

impl TableBuilder {
    /// Build from an N-way merge of the given sources.
    pub fn new(
        sources: Vec<RecordIterator>,
        storage: Arc<dyn Storage>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let merge = MergeIterator::new(sources)?;
        Ok(Self::from_stream(Box::new(merge), storage, config))
    }

    /// Build from an already-composed ordered stream (e.g. a compaction
    /// filter wrapped around a merge).
    pub fn from_stream(
        source: RecordIterator,
        storage: Arc<dyn Storage>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            source,
            peeked: None,
            storage,
            block_size: config.max_block_size,
            table_size: config.max_table_size,
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if let Some(record) = self.peeked.take() {
            return Ok(Some(record));
        }
        self.source.next().transpose()
    }

    /// True when the stream has no record left for `build` to consume.
    fn peek_is_empty(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.source.next().transpose()?;
        }
        Ok(self.peeked.is_none())
    }

    /// Emit the next table. Returns the temp file name, or `None` when the
    /// sources are drained.
    pub fn build(&mut self) -> Result<Option<String>> {
        let mut record = match self.next_record()? {
            Some(record) => record,
            None => return Ok(None),
        };

        let mut buf: Vec<u8> = Vec::with_capacity(self.table_size + 2 * self.block_size);
        // One entry per data block (its first key) plus a trailing entry for
        // the file's last key; each records the block-end offset at the time
        // it was pushed.
        let mut entries: Vec<(TaggedKey, u32)> = Vec::new();
        let mut last_block_end = 0usize;
        let mut block_first: Option<TaggedKey> = None;

        loop {
            if block_first.is_none() {
                block_first = Some(record.key.clone());
            }
            let last_key = record.key.clone();
            record::encode_record(&mut buf, &record);

            let drained = self.peek_is_empty()?;
            let block_full = buf.len() - last_block_end >= self.block_size;

            if block_full || drained {
                let first = block_first.take().expect("block has a first key");
                entries.push((first, buf.len() as u32));
                last_block_end = buf.len();
                if buf.len() >= self.table_size || drained {
                    entries.push((last_key, buf.len() as u32));
                    break;
                }
            }

            record = match self.next_record()? {
                Some(record) => record,
                None => unreachable!("peek reported records remaining"),
            };
        }

        // Index keys, remembering where each landed.
        let mut pairs: Vec<(u32, u32)> = Vec::with_capacity(entries.len());
        for (key, block_end) in &entries {
            pairs.push((*block_end, buf.len() as u32));
            record::encode_index_key(&mut buf, key);
        }
        let index_array_offset = buf.len() as u64;
        for (block_end, key_offset) in &pairs {
            buf.write_u32::<LittleEndian>(*block_end)
                .expect("vec write is infallible");
            buf.write_u32::<LittleEndian>(*key_offset)
                .expect("vec write is infallible");
        }
        buf.write_u64::<LittleEndian>(index_array_offset)
            .expect("vec write is infallible");

        // The whole table goes out in one append so the file is never
        // observable in a half-written state with a valid footer.
        let name = next_temp_name();
        let file = self.storage.open(&name, OpenMode::truncate())?;
        file.append(&buf)?;
        file.sync()?;
        Ok(Some(name))
    }
}
