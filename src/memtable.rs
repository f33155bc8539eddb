//! In-memory ordered write buffer.
//!
//! The mutable memtable is sharded: user keys hash across 16 ordered maps,
//! each behind its own reader-writer lock, so concurrent writers touching
//! different keys do not contend. Readers visit every shard, since there is
//! no ordering across shards; that is acceptable at this shard count.
//!
//! Freezing flips a flag and nothing else: no record ever moves between
//! shards, so readers that captured the table earlier (snapshots in
//! particular) race with nothing. A frozen memtable serves reads while its
//! flush is pending and exposes the ordered iterator the table builder
//! consumes, which merges the by-then immutable shards lazily.
//!
//! Writes couple the log append and the map insert under the owning shard's
//! exclusive lock, so a record is never visible in memory without having been
//! appended to the log first.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::log::LogManager;
use crate::record::{Record, TaggedKey, TaggedValue};

pub const SHARD_COUNT: usize = 16;

/// Outcome of a memtable or table point lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// A live record is visible at the read view.
    Live(Vec<u8>),
    /// The winning record at the read view is a tombstone.
    Tombstone,
}

type Shard = BTreeMap<TaggedKey, TaggedValue>;

pub struct Memtable {
    shards: [RwLock<Shard>; SHARD_COUNT],
    frozen: AtomicBool,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_hash(user_key: &[u8]) -> u64 {
    user_key
        .iter()
        .fold(0u64, |h, &b| h.wrapping_mul(2333).wrapping_add(b as u64))
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(BTreeMap::new())),
            frozen: AtomicBool::new(false),
        }
    }

    /// Rebuild a memtable from recovered log records. `frozen` marks the
    /// table immutable, matching the state it was in when its log was
    /// rotated.
    pub fn from_records(records: Vec<Record>, frozen: bool) -> Result<Self> {
        let memtable = Self::new();
        if frozen {
            memtable.frozen.store(true, Ordering::SeqCst);
        }
        for record in records {
            let shard = memtable.shard_of(&record.key.user_key);
            let mut map = memtable.shards[shard].write()?;
            if map.insert(record.key.clone(), record.value).is_some() {
                return Err(crate::corruption!(
                    "duplicate record for key {:?} at lsn {} in recovered log",
                    record.key.user_key,
                    record.key.lsn
                ));
            }
        }
        Ok(memtable)
    }

    fn shard_of(&self, user_key: &[u8]) -> usize {
        (shard_hash(user_key) % SHARD_COUNT as u64) as usize
    }

    /// Write a live record, appending it to the log under the shard lock.
    pub fn insert(&self, user_key: &[u8], lsn: u64, value: &[u8], log: &LogManager) -> Result<()> {
        self.write(
            Record::new(TaggedKey::new(user_key, lsn), TaggedValue::live(value)),
            log,
        )
    }

    /// Write a tombstone, appending it to the log under the shard lock.
    pub fn delete(&self, user_key: &[u8], lsn: u64, log: &LogManager) -> Result<()> {
        self.write(
            Record::new(TaggedKey::new(user_key, lsn), TaggedValue::tombstone()),
            log,
        )
    }

    fn write(&self, record: Record, log: &LogManager) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Internal(
                "write attempted on a frozen memtable".to_string(),
            ));
        }
        let shard = self.shard_of(&record.key.user_key);
        let mut map = self.shards[shard].write()?;
        if map.contains_key(&record.key) {
            return Err(Error::Internal(format!(
                "duplicate tagged key at lsn {}",
                record.key.lsn
            )));
        }
        log.append(&record)?;
        map.insert(record.key, record.value);
        Ok(())
    }

    /// Look up the record visible for `user_key` at `read_lsn`: the entry
    /// with the greatest tagged key at or below `(user_key, read_lsn)`,
    /// provided it belongs to the same user key.
    pub fn point_get(&self, user_key: &[u8], read_lsn: u64) -> Result<Option<Lookup>> {
        let shard = self.shard_of(user_key);
        let map = self.shards[shard].read()?;
        let cursor = TaggedKey::new(user_key, read_lsn);
        match map.range(..=cursor).next_back() {
            Some((key, value)) if key.user_key == user_key => {
                if value.deleted {
                    Ok(Some(Lookup::Tombstone))
                } else {
                    Ok(Some(Lookup::Live(value.value.clone())))
                }
            }
            _ => Ok(None),
        }
    }

    /// Collect the visible winner for every user key in `[lower, upper]` at
    /// `read_lsn`, in ascending user-key order. Tombstone winners are
    /// included so callers can shadow deeper layers with them.
    pub fn range_scan(&self, lower: &[u8], upper: &[u8], read_lsn: u64) -> Result<Vec<Record>> {
        if lower > upper {
            return Ok(Vec::new());
        }
        let start = TaggedKey::new(lower, 0);
        let end = TaggedKey::new(upper, u64::MAX);

        let mut candidates: Vec<Record> = Vec::new();
        for shard in &self.shards {
            let map = shard.read()?;
            for (key, value) in map.range(start.clone()..=end.clone()) {
                if key.lsn <= read_lsn {
                    candidates.push(Record::new(key.clone(), value.clone()));
                }
            }
        }
        candidates.sort_by(|a, b| a.key.cmp(&b.key));

        let mut winners: Vec<Record> = Vec::new();
        for record in candidates {
            if let Some(last) = winners.last() {
                if last.key.user_key == record.key.user_key {
                    winners.pop();
                }
            }
            winners.push(record);
        }
        Ok(winners)
    }

    /// Mark the table immutable. Shard contents stay put; from here on every
    /// access is read-only.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("memtable frozen twice".to_string()));
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Number of records across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().map(|map| map.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Greatest LSN present in the table, if any.
    pub fn max_lsn(&self) -> Result<Option<u64>> {
        let mut max = None;
        for shard in &self.shards {
            let map = shard.read()?;
            for key in map.keys() {
                max = Some(max.map_or(key.lsn, |m: u64| m.max(key.lsn)));
            }
        }
        Ok(max)
    }

    /// Ordered iterator over the full record sequence. Only valid on a
    /// frozen memtable, whose shards no longer change. The iterator keeps
    /// the memtable alive.
    pub fn ordered_iter(self: Arc<Self>) -> Result<MemtableIterator> {
        if !self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Internal(
                "ordered iteration requires a frozen memtable".to_string(),
            ));
        }
        Ok(MemtableIterator {
            memtable: self,
            current: None,
            exhausted: false,
        })
    }
}

/// Lazy cursor over a frozen memtable: each step takes the smallest key
/// past the previously yielded one across all shards, so the iterator holds
/// no lock between steps.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    current: Option<TaggedKey>,
    exhausted: bool,
}

impl Iterator for MemtableIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let mut best: Option<Record> = None;
        for shard in &self.memtable.shards {
            let map = match shard.read() {
                Ok(map) => map,
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err.into()));
                }
            };
            let range = match &self.current {
                Some(key) => (Bound::Excluded(key.clone()), Bound::Unbounded),
                None => (Bound::Unbounded, Bound::Unbounded),
            };
            if let Some((key, value)) = map.range(range).next() {
                if best.as_ref().map_or(true, |b| key < &b.key) {
                    best = Some(Record::new(key.clone(), value.clone()));
                }
            }
        }
        match best {
            Some(record) => {
                self.current = Some(record.key.clone());
                Some(Ok(record))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}
