//! The durable registry of table versions.
//!
//! `Versions` owns version numbering, table numbering, and the two-step
//! publication protocol: a new `version.N+1` file is written completely and
//! synced before `current` is atomically replaced to point at it. A crash
//! between the two leaves the previous version in effect; tables the
//! unpublished version introduced are orphans and are swept the next time
//! the store opens.
//!
//! ## Files
//!
//! ```text
//! current      decimal version number
//! version.N    one line per level: "count id id ..."; level 0 first
//! sst.ID       table files referenced by versions
//! tmp.N        build output not yet installed
//! ```
//!
//! Flush and compaction both run their builders before taking the manifest
//! lock; only the rename-and-publish step is serialized.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::iterator::{CompactionIterator, MergeIterator, RecordIterator};
use crate::memtable::Memtable;
use crate::sstable::{self, SSTable, TableBuilder};
use crate::storage::{OpenMode, Storage};
use crate::version::{overlap_range, Version};

pub const CURRENT_FILE: &str = "current";
const VERSION_PREFIX: &str = "version.";

pub struct Versions {
    storage: Arc<dyn Storage>,
    config: EngineConfig,
    /// Shared handle to the current version. Readers clone the `Arc` and
    /// never take the manifest lock.
    latest: RwLock<Arc<Version>>,
    inner: Mutex<VersionsInner>,
}

struct VersionsInner {
    version_number: u64,
    next_table_id: u64,
}

impl Versions {
    /// Open or create the manifest, recover the current version, sweep
    /// orphan files, and report the greatest LSN persisted in any table.
    pub fn open(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<(Self, u64)> {
        if !storage.exists(CURRENT_FILE) {
            write_file(storage.as_ref(), &format!("{VERSION_PREFIX}0"), b"")?;
            write_file(storage.as_ref(), CURRENT_FILE, b"0")?;
        }

        let current = read_file_string(storage.as_ref(), CURRENT_FILE)?;
        let version_number: u64 = current
            .trim()
            .parse()
            .map_err(|_| crate::corruption!("current file holds {current:?}"))?;

        let version = load_version(&storage, version_number)?;

        let mut next_table_id = 0;
        let mut max_lsn = 0;
        for table in version.all_tables() {
            next_table_id = next_table_id.max(table.id() + 1);
            max_lsn = max_lsn.max(Arc::clone(table).max_lsn()?);
        }

        sweep_orphans(storage.as_ref(), &version, true)?;

        tracing::info!(
            version = version_number,
            level0 = version.level0().len(),
            levels = version.levels().len(),
            next_table_id,
            "recovered table versions"
        );

        let versions = Self {
            storage,
            config,
            latest: RwLock::new(Arc::new(version)),
            inner: Mutex::new(VersionsInner {
                version_number,
                next_table_id,
            }),
        };
        Ok((versions, max_lsn))
    }

    /// Current version handle. Cheap; safe to hold across any amount of
    /// later activity.
    pub fn latest(&self) -> Arc<Version> {
        self.latest.read().expect("latest lock poisoned").clone()
    }

    /// Build level-0 tables from a frozen memtable and publish a version
    /// that includes them. On failure nothing is published and any build
    /// output is removed.
    pub fn install_flush(&self, memtable: &Arc<Memtable>) -> Result<()> {
        let sources: Vec<RecordIterator> = vec![Box::new(Arc::clone(memtable).ordered_iter()?)];
        let mut builder = TableBuilder::new(sources, Arc::clone(&self.storage), &self.config)?;
        let temps = self.drain_builder(&mut builder)?;
        if temps.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock()?;
        let new_tables = self.install_tables(&mut inner, temps)?;
        let count = new_tables.len();
        let next = self.latest().with_flushed_tables(new_tables);
        self.publish(&mut inner, next)?;

        tracing::info!(tables = count, "installed memtable flush");
        Ok(())
    }

    /// Run at most one compaction step. Returns whether anything was done.
    pub fn maybe_compact(&self) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        let version = self.latest();

        if version.level0().len() > self.config.level0_compaction_threshold {
            self.compact_level0(&mut inner, &version)?;
            return Ok(true);
        }
        for (level_idx, tables) in version.levels().iter().enumerate() {
            if tables.len() > self.config.level_capacity(level_idx + 1) {
                self.compact_level(&mut inner, &version, level_idx)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merge the closure of overlapping level-0 tables, plus the level-1
    /// tables they intersect, into new level-1 tables.
    fn compact_level0(&self, inner: &mut VersionsInner, version: &Arc<Version>) -> Result<()> {
        let (selected, left, right) = version.l0_compaction_inputs();
        let level1 = version.levels().first();
        let replaced = level1.and_then(|tables| overlap_range(tables, &left, &right));

        let mut sources: Vec<RecordIterator> = Vec::new();
        for &i in &selected {
            sources.push(Box::new(Arc::clone(&version.level0()[i]).iter(None)?));
        }
        if let (Some(tables), Some((start, end))) = (level1, replaced) {
            for table in &tables[start..=end] {
                sources.push(Box::new(Arc::clone(table).iter(None)?));
            }
        }

        // Tombstones are dead once the output level is the deepest one
        // holding data.
        let bottom = version.levels().iter().skip(1).all(|level| level.is_empty());
        let new_tables = self.build_merged(inner, sources, bottom)?;

        let next = version.with_l0_compacted(&selected, replaced, new_tables);
        self.publish(inner, next)?;

        for &i in &selected {
            version.level0()[i].mark_evict();
        }
        if let (Some(tables), Some((start, end))) = (level1, replaced) {
            for table in &tables[start..=end] {
                table.mark_evict();
            }
        }

        tracing::info!(
            sources = selected.len(),
            replaced = replaced.map_or(0, |(s, e)| e - s + 1),
            "compacted level 0 into level 1"
        );
        Ok(())
    }

    /// Merge one source table from a deep level into the next level down,
    /// advancing that level's round-robin cursor.
    fn compact_level(
        &self,
        inner: &mut VersionsInner,
        version: &Arc<Version>,
        level_idx: usize,
    ) -> Result<()> {
        let source = version.pick_level_source(level_idx);
        let source_table = &version.levels()[level_idx][source];
        let left = source_table.first_key().clone();
        let right = source_table.last_key().clone();

        let next_level = version.levels().get(level_idx + 1);
        let replaced = next_level.and_then(|tables| overlap_range(tables, &left, &right));

        let mut sources: Vec<RecordIterator> = vec![Box::new(Arc::clone(source_table).iter(None)?)];
        if let (Some(tables), Some((start, end))) = (next_level, replaced) {
            for table in &tables[start..=end] {
                sources.push(Box::new(Arc::clone(table).iter(None)?));
            }
        }

        let bottom = version
            .levels()
            .iter()
            .skip(level_idx + 2)
            .all(|level| level.is_empty());
        let new_tables = self.build_merged(inner, sources, bottom)?;

        let next = version.with_level_compacted(level_idx, source, replaced, new_tables, right);
        self.publish(inner, next)?;

        source_table.mark_evict();
        if let (Some(tables), Some((start, end))) = (next_level, replaced) {
            for table in &tables[start..=end] {
                table.mark_evict();
            }
        }

        tracing::info!(
            level = level_idx + 1,
            replaced = replaced.map_or(0, |(s, e)| e - s + 1),
            "compacted one table into the next level"
        );
        Ok(())
    }

    /// Merge the sources through the compaction filter, build the output
    /// tables, and install them under fresh IDs.
    fn build_merged(
        &self,
        inner: &mut VersionsInner,
        sources: Vec<RecordIterator>,
        drop_tombstones: bool,
    ) -> Result<Vec<Arc<SSTable>>> {
        let merge = MergeIterator::new(sources)?;
        let stream = CompactionIterator::new(merge, drop_tombstones);
        let mut builder =
            TableBuilder::from_stream(Box::new(stream), Arc::clone(&self.storage), &self.config);
        let temps = self.drain_builder(&mut builder)?;
        self.install_tables(inner, temps)
    }

    /// Run the builder to exhaustion, unlinking partial output on failure.
    fn drain_builder(&self, builder: &mut TableBuilder) -> Result<Vec<String>> {
        let mut temps = Vec::new();
        loop {
            match builder.build() {
                Ok(Some(name)) => temps.push(name),
                Ok(None) => return Ok(temps),
                Err(err) => {
                    for name in &temps {
                        let _ = self.storage.unlink(name);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Rename temp files to `sst.<id>` under fresh IDs and open them.
    fn install_tables(
        &self,
        inner: &mut VersionsInner,
        temps: Vec<String>,
    ) -> Result<Vec<Arc<SSTable>>> {
        let mut tables = Vec::with_capacity(temps.len());
        for (i, temp) in temps.iter().enumerate() {
            let result = (|| {
                let id = inner.next_table_id;
                let name = sstable::table_file_name(id);
                self.storage.rename(temp, &name)?;
                inner.next_table_id += 1;
                SSTable::open(Arc::clone(&self.storage), &name).map(Arc::new)
            })();
            match result {
                Ok(table) => tables.push(table),
                Err(err) => {
                    // Remove everything this call produced; already-renamed
                    // tables are unpublished and therefore orphans.
                    for table in &tables {
                        let _ = self.storage.unlink(table.name());
                    }
                    for temp in &temps[i..] {
                        let _ = self.storage.unlink(temp);
                    }
                    return Err(err);
                }
            }
        }
        Ok(tables)
    }

    /// Publish `next` as the current version: write `version.N+1` in full,
    /// sync it, then atomically replace `current`.
    fn publish(&self, inner: &mut VersionsInner, next: Version) -> Result<()> {
        let number = inner.version_number + 1;
        write_file(
            self.storage.as_ref(),
            &format!("{VERSION_PREFIX}{number}"),
            serialize_version(&next).as_bytes(),
        )?;
        write_file_atomic(
            self.storage.as_ref(),
            CURRENT_FILE,
            number.to_string().as_bytes(),
        )?;
        inner.version_number = number;
        *self.latest.write()? = Arc::new(next);
        Ok(())
    }

    /// Best-effort removal of `sst.*` files the current version does not
    /// reference.
    pub fn garbage_collect(&self) -> Result<()> {
        let _inner = self.inner.lock()?;
        let version = self.latest();
        sweep_orphans(self.storage.as_ref(), &version, false)
    }
}

fn load_version(storage: &Arc<dyn Storage>, number: u64) -> Result<Version> {
    let name = format!("{VERSION_PREFIX}{number}");
    let text = read_file_string(storage.as_ref(), &name)?;

    let mut level_ids: Vec<Vec<u64>> = Vec::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let count: usize = fields
            .next()
            .expect("non-empty line has a first field")
            .parse()
            .map_err(|_| crate::corruption!("bad table count in {name}"))?;
        let ids: Vec<u64> = fields
            .map(|field| {
                field
                    .parse()
                    .map_err(|_| crate::corruption!("bad table id in {name}"))
            })
            .collect::<Result<_>>()?;
        if ids.len() != count {
            return Err(crate::corruption!(
                "{name} declares {count} tables but lists {}",
                ids.len()
            ));
        }
        level_ids.push(ids);
    }

    let open_level = |ids: &[u64]| -> Result<Vec<Arc<SSTable>>> {
        ids.iter()
            .map(|&id| {
                SSTable::open(Arc::clone(storage), &sstable::table_file_name(id)).map(Arc::new)
            })
            .collect()
    };

    let level0 = match level_ids.first() {
        Some(ids) => open_level(ids)?,
        None => Vec::new(),
    };
    let mut levels = Vec::new();
    for ids in level_ids.iter().skip(1) {
        let tables = open_level(ids)?;
        for pair in tables.windows(2) {
            if pair[0].last_key() >= pair[1].first_key() {
                return Err(crate::corruption!(
                    "tables {} and {} overlap within a sorted level",
                    pair[0].id(),
                    pair[1].id()
                ));
            }
        }
        levels.push(tables);
    }

    Ok(Version::new(level0, levels))
}

fn serialize_version(version: &Version) -> String {
    let mut out = String::new();
    let line = |tables: &[Arc<SSTable>]| {
        let ids = tables.iter().map(|table| table.id()).join(" ");
        if ids.is_empty() {
            "0\n".to_string()
        } else {
            format!("{} {}\n", tables.len(), ids)
        }
    };
    out.push_str(&line(version.level0()));
    for level in version.levels() {
        out.push_str(&line(level));
    }
    out
}

/// Remove unreferenced `sst.*` files, plus `tmp.*` leftovers when opening
/// (a live builder owns its temp files, so runtime sweeps leave them alone).
fn sweep_orphans(storage: &dyn Storage, version: &Version, sweep_temps: bool) -> Result<()> {
    let referenced: HashSet<u64> = version.all_tables().map(|table| table.id()).collect();
    for name in storage.list()? {
        let orphan = match sstable::parse_table_file_name(&name) {
            Some(id) => !referenced.contains(&id),
            None => sweep_temps && name.starts_with(sstable::TEMP_PREFIX),
        };
        if orphan {
            tracing::info!(file = %name, "removing orphan file");
            let _ = storage.unlink(&name);
        }
    }
    Ok(())
}

fn read_file_string(storage: &dyn Storage, name: &str) -> Result<String> {
    let file = storage.open(name, OpenMode::read())?;
    let mut buf = vec![0u8; file.len()? as usize];
    file.read_exact_at(0, &mut buf)?;
    String::from_utf8(buf).map_err(|_| crate::corruption!("{name} is not valid text"))
}

fn write_file(storage: &dyn Storage, name: &str, contents: &[u8]) -> Result<()> {
    let file = storage.open(name, OpenMode::truncate())?;
    file.append(contents)?;
    file.sync()
}

/// Replace `name` via a synced temp file and an atomic rename.
fn write_file_atomic(storage: &dyn Storage, name: &str, contents: &[u8]) -> Result<()> {
    let temp = format!("{name}.next");
    write_file(storage, &temp, contents)?;
    storage.rename(&temp, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, TaggedKey, TaggedValue};
    use crate::storage::MemStorage;

    fn record(key: &[u8], lsn: u64, value: &[u8]) -> Record {
        Record::new(TaggedKey::new(key, lsn), TaggedValue::live(value))
    }

    fn frozen_memtable(records: Vec<Record>) -> Arc<Memtable> {
        Arc::new(Memtable::from_records(records, true).expect("Failed to build memtable"))
    }

    fn open(storage: &Arc<MemStorage>, config: EngineConfig) -> (Versions, u64) {
        let storage: Arc<dyn Storage> = Arc::clone(storage) as Arc<dyn Storage>;
        Versions::open(storage, config).expect("Failed to open versions")
    }

    #[test]
    fn test_open_creates_empty_manifest() {
        let storage = Arc::new(MemStorage::new());
        let (versions, max_lsn) = open(&storage, EngineConfig::default());

        assert_eq!(max_lsn, 0);
        assert!(storage.exists("current"));
        assert!(storage.exists("version.0"));
        assert!(versions.latest().level0().is_empty());
    }

    #[test]
    fn test_install_flush_and_reopen() {
        let storage = Arc::new(MemStorage::new());
        let (versions, _) = open(&storage, EngineConfig::default());

        let memtable = frozen_memtable(vec![
            record(b"a", 1, b"1"),
            record(b"b", 2, b"2"),
            record(b"c", 3, b"3"),
        ]);
        versions
            .install_flush(&memtable)
            .expect("Failed to install flush");

        let version = versions.latest();
        assert_eq!(version.level0().len(), 1);
        assert_eq!(
            version
                .point_get(&TaggedKey::new(*b"b", u64::MAX))
                .expect("get"),
            Some(crate::memtable::Lookup::Live(b"2".to_vec()))
        );
        drop(versions);

        let (reopened, max_lsn) = open(&storage, EngineConfig::default());
        assert_eq!(max_lsn, 3);
        let version = reopened.latest();
        assert_eq!(version.level0().len(), 1);
        assert_eq!(
            version
                .point_get(&TaggedKey::new(*b"c", u64::MAX))
                .expect("get"),
            Some(crate::memtable::Lookup::Live(b"3".to_vec()))
        );
    }

    #[test]
    fn test_install_empty_flush_is_noop() {
        let storage = Arc::new(MemStorage::new());
        let (versions, _) = open(&storage, EngineConfig::default());

        versions
            .install_flush(&frozen_memtable(vec![]))
            .expect("empty flush");
        assert!(versions.latest().level0().is_empty());
    }

    #[test]
    fn test_compaction_moves_l0_to_l1() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default().level0_compaction_threshold(2);
        let (versions, _) = open(&storage, config);

        // Three overlapping flushes of the same keys.
        for round in 0..3u64 {
            let records = (0..20u64)
                .map(|i| {
                    record(
                        format!("key_{i:02}").as_bytes(),
                        round * 100 + i + 1,
                        format!("round_{round}").as_bytes(),
                    )
                })
                .collect();
            versions
                .install_flush(&frozen_memtable(records))
                .expect("flush");
        }
        assert_eq!(versions.latest().level0().len(), 3);

        assert!(versions.maybe_compact().expect("compact"));
        let version = versions.latest();
        assert!(version.level0().is_empty());
        assert_eq!(version.levels().len(), 1);
        assert!(!version.levels()[0].is_empty());

        // The newest round won everywhere.
        for i in 0..20u64 {
            let key = format!("key_{i:02}");
            assert_eq!(
                version
                    .point_get(&TaggedKey::new(key.as_bytes(), u64::MAX))
                    .expect("get"),
                Some(crate::memtable::Lookup::Live(b"round_2".to_vec())),
                "key {key} must hold the newest value"
            );
        }

        // No further compaction is due.
        assert!(!versions.maybe_compact().expect("compact"));
    }

    #[test]
    fn test_compaction_evicts_replaced_tables() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default().level0_compaction_threshold(1);
        let (versions, _) = open(&storage, config);

        versions
            .install_flush(&frozen_memtable(vec![record(b"a", 1, b"1")]))
            .expect("flush");
        versions
            .install_flush(&frozen_memtable(vec![record(b"a", 2, b"2")]))
            .expect("flush");
        let old_names: Vec<String> = versions
            .latest()
            .level0()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(old_names.len(), 2);

        assert!(versions.maybe_compact().expect("compact"));

        for name in &old_names {
            assert!(
                !storage.exists(name),
                "replaced table {name} must be unlinked once unreferenced"
            );
        }
        let version = versions.latest();
        for table in version.all_tables() {
            assert!(storage.exists(table.name()));
        }
    }

    #[test]
    fn test_open_sweeps_orphans() {
        let storage = Arc::new(MemStorage::new());
        {
            let (versions, _) = open(&storage, EngineConfig::default());
            versions
                .install_flush(&frozen_memtable(vec![record(b"a", 1, b"1")]))
                .expect("flush");
        }

        // Plant an orphan table and a stale temp file.
        for name in ["sst.999", "tmp.7"] {
            storage
                .open(name, OpenMode::truncate())
                .expect("create")
                .append(b"junk")
                .expect("write");
        }

        let (versions, _) = open(&storage, EngineConfig::default());
        assert!(!storage.exists("sst.999"));
        assert!(!storage.exists("tmp.7"));
        // The referenced table survived.
        assert_eq!(versions.latest().level0().len(), 1);
    }

    #[test]
    fn test_corrupt_current_refuses_to_open() {
        let storage = Arc::new(MemStorage::new());
        {
            open(&storage, EngineConfig::default());
        }
        write_file(storage.as_ref(), CURRENT_FILE, b"not a number").expect("write");

        let dyn_storage: Arc<dyn Storage> = Arc::clone(&storage) as Arc<dyn Storage>;
        assert!(matches!(
            Versions::open(dyn_storage, EngineConfig::default()),
            Err(crate::error::Error::Corruption(_))
        ));
    }

    #[test]
    fn test_missing_version_file_refuses_to_open() {
        let storage = Arc::new(MemStorage::new());
        {
            open(&storage, EngineConfig::default());
        }
        write_file(storage.as_ref(), CURRENT_FILE, b"42").expect("write");

        let dyn_storage: Arc<dyn Storage> = Arc::clone(&storage) as Arc<dyn Storage>;
        assert!(Versions::open(dyn_storage, EngineConfig::default()).is_err());
    }

    #[test]
    fn test_garbage_collect_removes_unreferenced() {
        let storage = Arc::new(MemStorage::new());
        let (versions, _) = open(&storage, EngineConfig::default());
        versions
            .install_flush(&frozen_memtable(vec![record(b"a", 1, b"1")]))
            .expect("flush");

        storage
            .open("sst.500", OpenMode::truncate())
            .expect("create")
            .append(b"junk")
            .expect("write");

        versions.garbage_collect().expect("gc");
        assert!(!storage.exists("sst.500"));
        assert_eq!(versions.latest().level0().len(), 1);
    }

    #[test]
    fn test_version_serialization_roundtrip() {
        let storage = Arc::new(MemStorage::new());
        let config = EngineConfig::default().level0_compaction_threshold(1);
        let (versions, _) = open(&storage, config.clone());

        versions
            .install_flush(&frozen_memtable(vec![record(b"a", 1, b"1")]))
            .expect("flush");
        versions
            .install_flush(&frozen_memtable(vec![record(b"z", 2, b"2")]))
            .expect("flush");
        versions.maybe_compact().expect("compact");
        versions
            .install_flush(&frozen_memtable(vec![record(b"m", 3, b"3")]))
            .expect("flush");
        drop(versions);

        // Reopen: the "z" table never overlapped the seed so it stayed in
        // level 0, joined by the "m" flush; the compaction made one deep level.
        let (reopened, _) = open(&storage, config);
        let version = reopened.latest();
        assert_eq!(version.level0().len(), 2);
        assert_eq!(version.levels().len(), 1);
        for key in [&b"a"[..], b"m", b"z"] {
            assert!(
                version
                    .point_get(&TaggedKey::new(key, u64::MAX))
                    .expect("get")
                    .is_some(),
                "key {key:?} must survive reopen"
            );
        }
    }
}
