//! Immutable snapshots of the table set.
//!
//! A `Version` is the unit of visibility for on-disk data: level 0 holds
//! tables straight from memtable flushes (their key ranges may overlap),
//! deeper levels are sorted runs of non-overlapping tables. A version never
//! changes after publication: flushes and compactions derive a successor
//! and publish it through the manifest, while readers and snapshots keep
//! using whatever version they captured.

use std::sync::Arc;

use crate::error::Result;
use crate::iterator::RecordIterator;
use crate::memtable::Lookup;
use crate::record::{Record, TaggedKey};
use crate::sstable::SSTable;

#[derive(Clone, Default)]
pub struct Version {
    /// Flush output, possibly overlapping, in installation order.
    level0: Vec<Arc<SSTable>>,
    /// `levels[i]` is level `i + 1`: sorted, pairwise non-overlapping.
    levels: Vec<Vec<Arc<SSTable>>>,
    /// Round-robin compaction cursor per deep level: the last key of the
    /// most recently compacted source table. In-memory only.
    last_compaction_key: Vec<Option<TaggedKey>>,
}

impl Version {
    pub fn new(level0: Vec<Arc<SSTable>>, levels: Vec<Vec<Arc<SSTable>>>) -> Self {
        let depth = levels.len();
        Self {
            level0,
            levels,
            last_compaction_key: vec![None; depth],
        }
    }

    pub fn level0(&self) -> &[Arc<SSTable>] {
        &self.level0
    }

    pub fn levels(&self) -> &[Vec<Arc<SSTable>>] {
        &self.levels
    }

    pub fn last_compaction_key(&self, level_idx: usize) -> Option<&TaggedKey> {
        self.last_compaction_key.get(level_idx)?.as_ref()
    }

    /// Every table referenced by this version.
    pub fn all_tables(&self) -> impl Iterator<Item = &Arc<SSTable>> {
        self.level0.iter().chain(self.levels.iter().flatten())
    }

    /// Look up the visible record for `key`. Level 0 is consulted first
    /// (every overlapping table, newest winner by LSN), then each deeper
    /// level in order. The first layer with a definitive answer wins.
    pub fn point_get(&self, key: &TaggedKey) -> Result<Option<Lookup>> {
        let mut winner: Option<Record> = None;
        for table in &self.level0 {
            if let Some(record) = table.point_get(key)? {
                match &winner {
                    Some(current) if current.key.lsn >= record.key.lsn => {}
                    _ => winner = Some(record),
                }
            }
        }
        if let Some(record) = winner {
            return Ok(Some(lookup_of(record)));
        }

        for level in &self.levels {
            // Tables in a deep level hold disjoint user-key ranges, so at
            // most one can contain the key. The search is by user key: the
            // tagged bounds of a table say nothing about which LSNs of a
            // key it holds.
            let idx =
                level.partition_point(|table| table.last_key().user_key < key.user_key);
            if idx < level.len() {
                if let Some(record) = level[idx].point_get(key)? {
                    return Ok(Some(lookup_of(record)));
                }
            }
        }
        Ok(None)
    }

    /// One ordered iterator per table whose user-key range intersects
    /// `[lower, upper]`, each positioned at the first record with user key
    /// >= `lower`.
    pub fn range_sources(&self, lower: &[u8], upper: &[u8]) -> Result<Vec<RecordIterator>> {
        let from = TaggedKey::new(lower, 0);
        let mut sources: Vec<RecordIterator> = Vec::new();

        for table in &self.level0 {
            if table.last_key().user_key.as_slice() < lower
                || table.first_key().user_key.as_slice() > upper
            {
                continue;
            }
            sources.push(Box::new(Arc::clone(table).iter(Some(&from))?));
        }
        for level in &self.levels {
            for table in level {
                if table.last_key().user_key.as_slice() < lower
                    || table.first_key().user_key.as_slice() > upper
                {
                    continue;
                }
                sources.push(Box::new(Arc::clone(table).iter(Some(&from))?));
            }
        }
        Ok(sources)
    }

    /// Level-0 compaction input: the closure of overlapping tables seeded
    /// with table 0, and the merged key range. Expands until a pass adds
    /// nothing, since adding a table can widen the range onto tables that
    /// did not overlap the seed.
    pub fn l0_compaction_inputs(&self) -> (Vec<usize>, TaggedKey, TaggedKey) {
        let mut selected = vec![false; self.level0.len()];
        selected[0] = true;
        let mut left = self.level0[0].first_key().clone();
        let mut right = self.level0[0].last_key().clone();

        loop {
            let mut grew = false;
            for (i, table) in self.level0.iter().enumerate() {
                // Overlap is judged on user keys: two tables holding the
                // same key at different LSNs must end up in one merge.
                if selected[i]
                    || table.last_key().user_key < left.user_key
                    || table.first_key().user_key > right.user_key
                {
                    continue;
                }
                selected[i] = true;
                grew = true;
                if table.first_key().user_key < left.user_key {
                    left = table.first_key().clone();
                }
                if table.last_key().user_key > right.user_key {
                    right = table.last_key().clone();
                }
            }
            if !grew {
                break;
            }
        }

        let indices = (0..self.level0.len()).filter(|&i| selected[i]).collect();
        (indices, left, right)
    }

    /// Source table for a deep-level compaction: the first table whose
    /// first key is past the level's cursor, wrapping to 0.
    pub fn pick_level_source(&self, level_idx: usize) -> usize {
        let tables = &self.levels[level_idx];
        match &self.last_compaction_key[level_idx] {
            Some(cursor) => tables
                .iter()
                .position(|table| table.first_key() > cursor)
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Derive the successor version a flush publishes: the new tables are
    /// appended to level 0.
    pub fn with_flushed_tables(&self, tables: Vec<Arc<SSTable>>) -> Version {
        let mut next = self.clone();
        next.level0.extend(tables);
        next
    }

    /// Derive the successor of a level-0 compaction: the selected level-0
    /// tables and the replaced level-1 range give way to the merge output,
    /// spliced into level 1 at the removed position (or at the sorted
    /// position when nothing was replaced).
    pub fn with_l0_compacted(
        &self,
        removed_l0: &[usize],
        replaced: Option<(usize, usize)>,
        new_tables: Vec<Arc<SSTable>>,
    ) -> Version {
        let mut next = self.clone();
        for &i in removed_l0.iter().rev() {
            next.level0.remove(i);
        }
        next.ensure_level(0);
        splice_level(&mut next.levels[0], replaced, new_tables);
        next
    }

    /// Derive the successor of a deep-level compaction and advance the
    /// level's round-robin cursor past the consumed source table.
    pub fn with_level_compacted(
        &self,
        level_idx: usize,
        source: usize,
        replaced: Option<(usize, usize)>,
        new_tables: Vec<Arc<SSTable>>,
        cursor: TaggedKey,
    ) -> Version {
        let mut next = self.clone();
        next.ensure_level(level_idx + 1);
        next.levels[level_idx].remove(source);
        splice_level(&mut next.levels[level_idx + 1], replaced, new_tables);
        next.last_compaction_key[level_idx] = Some(cursor);
        next
    }

    fn ensure_level(&mut self, level_idx: usize) {
        while self.levels.len() <= level_idx {
            self.levels.push(Vec::new());
            self.last_compaction_key.push(None);
        }
    }
}

/// Contiguous range (inclusive) of sorted, non-overlapping tables whose
/// user-key range intersects that of `[left, right]`.
pub fn overlap_range(
    tables: &[Arc<SSTable>],
    left: &TaggedKey,
    right: &TaggedKey,
) -> Option<(usize, usize)> {
    let start = tables.partition_point(|table| table.last_key().user_key < left.user_key);
    let mut end = start;
    while end < tables.len() && tables[end].first_key().user_key <= right.user_key {
        end += 1;
    }
    if start < end {
        Some((start, end - 1))
    } else {
        None
    }
}

fn splice_level(
    level: &mut Vec<Arc<SSTable>>,
    replaced: Option<(usize, usize)>,
    new_tables: Vec<Arc<SSTable>>,
) {
    match replaced {
        Some((start, end)) => {
            level.splice(start..=end, new_tables);
        }
        None => {
            let at = match new_tables.first() {
                Some(first) => {
                    level.partition_point(|table| table.last_key() < first.first_key())
                }
                None => return,
            };
            level.splice(at..at, new_tables);
        }
    }
}

fn lookup_of(record: Record) -> Lookup {
    if record.value.deleted {
        Lookup::Tombstone
    } else {
        Lookup::Live(record.value.value)
    }
}
