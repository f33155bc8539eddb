//! Ordered record streams and their composition.
//!
//! Every source of sorted records (a frozen memtable, a table file) is
//! exposed as an iterator of `Result<Record>` with strictly increasing tagged
//! keys that owns whatever resources it opened. [`MergeIterator`] combines N
//! of them into one such stream with a binary min-heap. Tagged keys are
//! unique across all live sources (LSNs are never reused), so the merge never
//! has to break ties.
//!
//! [`CompactionIterator`] is the one place record streams are thinned: it
//! keeps only the newest version of each user key, and can drop tombstones
//! outright when the compaction output lands in the deepest populated level.
//! That is safe because versions are immutable: any read view created after
//! the compaction holds an LSN above every record being merged, and older
//! read views pin the previous version and its files.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::record::Record;

/// A finite, single-pass stream of records in strictly increasing tagged-key
/// order.
pub type RecordIterator = Box<dyn Iterator<Item = Result<Record>> + Send>;

struct HeapEntry {
    record: Record,
    source_index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.record.key.cmp(&other.record.key) {
            Ordering::Equal => self.source_index.cmp(&other.source_index),
            order => order.reverse(), // Reverse for min-heap behavior
        }
    }
}

/// N-way merge of ordered record streams.
pub struct MergeIterator {
    sources: Vec<RecordIterator>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl MergeIterator {
    /// Prime the heap with the head of each source.
    pub fn new(mut sources: Vec<RecordIterator>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source_index, source) in sources.iter_mut().enumerate() {
            match source.next() {
                Some(Ok(record)) => heap.push(HeapEntry {
                    record,
                    source_index,
                }),
                Some(Err(err)) => return Err(err),
                None => {}
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: false,
        })
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let entry = self.heap.pop()?;
        match self.sources[entry.source_index].next() {
            Some(Ok(record)) => self.heap.push(HeapEntry {
                record,
                source_index: entry.source_index,
            }),
            Some(Err(err)) => {
                self.failed = true;
                return Some(Err(err));
            }
            None => {}
        }
        Some(Ok(entry.record))
    }
}

/// Compaction filter over a merged stream: yields the newest record per user
/// key, optionally discarding tombstones.
pub struct CompactionIterator<I> {
    inner: I,
    drop_tombstones: bool,
    pending: Option<Record>,
    failed: bool,
}

impl<I: Iterator<Item = Result<Record>>> CompactionIterator<I> {
    pub fn new(inner: I, drop_tombstones: bool) -> Self {
        Self {
            inner,
            drop_tombstones,
            pending: None,
            failed: false,
        }
    }
}

impl<I: Iterator<Item = Result<Record>>> Iterator for CompactionIterator<I> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            // The newest version of a user key is the last record of its run:
            // the input is ordered by (user key, lsn) ascending.
            let mut current = match self.pending.take() {
                Some(record) => record,
                None => match self.inner.next()? {
                    Ok(record) => record,
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                },
            };
            loop {
                match self.inner.next() {
                    Some(Ok(next)) => {
                        if next.key.user_key == current.key.user_key {
                            current = next;
                        } else {
                            self.pending = Some(next);
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                    None => break,
                }
            }
            if self.drop_tombstones && current.value.deleted {
                continue;
            }
            return Some(Ok(current));
        }
    }
}
