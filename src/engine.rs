//! The public storage engine.
//!
//! ## Write path
//!
//! 1. Size-check, assign an LSN from the global counter.
//! 2. Append to `mem.log` and insert into the mutable memtable, both under
//!    the owning shard's lock.
//! 3. A writer that finds the log at or past the rotation threshold rotates
//!    the log, freezes the mutable memtable into the immutable slot, and
//!    wakes the background worker. Writers stall at that check while a
//!    previous immutable memtable is still being flushed.
//!
//! ## Read path
//!
//! Every read consumes an LSN as its read view, then consults the mutable
//! memtable, the immutable memtable, and the current version in that order;
//! the first layer with a definitive answer (live record or tombstone) wins.
//!
//! ## Background worker
//!
//! One OS thread. A condvar plus a `scheduled` flag forms the wakeup
//! semaphore; redundant wakeups are suppressed. Each cycle flushes the
//! immutable memtable if one is parked, then runs at most one compaction
//! step. Failures are logged and retried on the next trigger; foreground
//! operations never observe them.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::config::{EngineConfig, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::error::{Error, Result};
use crate::iterator::{MergeIterator, RecordIterator};
use crate::log::{LogManager, IMM_LOG};
use crate::manifest::Versions;
use crate::memtable::{Lookup, Memtable};
use crate::record::{Record, TaggedKey};
use crate::storage::{DiskStorage, Storage};
use crate::version::Version;

/// An embedded ordered key-value store.
///
/// All operations are thread-safe; clones of the internal state are shared
/// with one background worker that owns flush and compaction.
pub struct Engine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: EngineConfig,
    /// Next LSN to assign. Every operation, reads included, consumes one.
    next_lsn: AtomicU64,
    /// Guards the (mutable, immutable) memtable handles. Writers and readers
    /// take it shared; rotation and the flush handoff take it exclusively.
    mem: RwLock<MemPair>,
    log: LogManager,
    versions: Versions,
    worker_state: Mutex<WorkerState>,
    /// Wakes the background worker.
    worker_signal: Condvar,
    /// Wakes writers stalled on a pending flush.
    flush_signal: Condvar,
}

struct MemPair {
    mutable: Arc<Memtable>,
    immutable: Option<Arc<Memtable>>,
}

struct WorkerState {
    scheduled: bool,
    shutdown: bool,
    /// Bumped after every cleared flush so stalled writers can re-check.
    flushes_done: u64,
}

impl Engine {
    /// Open or create a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let storage: Arc<dyn Storage> = Arc::new(DiskStorage::new(dir)?);
        Self::open_with_storage(storage, config)
    }

    /// Open or create a store on an explicit storage backend.
    pub fn open_with_storage(storage: Arc<dyn Storage>, config: EngineConfig) -> Result<Self> {
        let (versions, table_max_lsn) = Versions::open(Arc::clone(&storage), config.clone())?;

        let imm_pending = storage.exists(IMM_LOG);
        let (log, imm_records, mem_records) = LogManager::recover(Arc::clone(&storage))?;

        let mut max_lsn = table_max_lsn;
        for record in imm_records.iter().chain(mem_records.iter()) {
            max_lsn = max_lsn.max(record.key.lsn);
        }

        let mutable = Arc::new(Memtable::from_records(mem_records, false)?);
        let immutable = if imm_pending {
            Some(Arc::new(Memtable::from_records(imm_records, true)?))
        } else {
            None
        };

        tracing::info!(
            next_lsn = max_lsn + 1,
            mutable_records = mutable.len(),
            flush_pending = immutable.is_some(),
            "opened store"
        );

        let shared = Arc::new(Shared {
            config,
            next_lsn: AtomicU64::new(max_lsn + 1),
            mem: RwLock::new(MemPair { mutable, immutable }),
            log,
            versions,
            worker_state: Mutex::new(WorkerState {
                scheduled: false,
                shutdown: false,
                flushes_done: 0,
            }),
            worker_signal: Condvar::new(),
            flush_signal: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("emberdb-worker".to_string())
                .spawn(move || worker_loop(shared))
                .map_err(|err| Error::Internal(format!("failed to spawn worker: {err}")))?
        };

        let engine = Self {
            shared,
            worker: Mutex::new(Some(worker)),
        };
        // Kick the worker once so a flush interrupted by a crash resumes,
        // and any overdue compaction gets its step.
        engine.shared.schedule_worker();
        Ok(engine)
    }

    /// Write a key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        check_value(value)?;
        self.shared.maybe_rotate()?;
        let lsn = self.shared.assign_lsn();
        let pair = self.shared.mem.read()?;
        pair.mutable.insert(key, lsn, value, &self.shared.log)
    }

    /// Delete a key. Reads first and returns `NotFound` without writing
    /// anything when no live record is visible, so absent keys never cost a
    /// tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        check_key(key)?;
        self.shared.maybe_rotate()?;
        let lsn = self.shared.assign_lsn();
        match self.shared.read_view(lsn)?.lookup(key)? {
            Some(Lookup::Live(_)) => {
                let pair = self.shared.mem.read()?;
                pair.mutable.delete(key, lsn, &self.shared.log)
            }
            Some(Lookup::Tombstone) | None => Err(Error::NotFound),
        }
    }

    /// Read the value for a key, `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let lsn = self.shared.assign_lsn();
        self.shared.read_view(lsn)?.get(key)
    }

    /// Durably persist every write whose LSN was assigned before this call.
    pub fn sync(&self) -> Result<()> {
        self.shared.log.sync()
    }

    /// Visit every key in `[lower, upper]` with a visible live record, in
    /// ascending key order, as of a read view taken at call time.
    pub fn range_scan(
        &self,
        lower: &[u8],
        upper: &[u8],
        visitor: impl FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        check_key(lower)?;
        check_key(upper)?;
        let lsn = self.shared.assign_lsn();
        self.shared.read_view(lsn)?.visit(lower, upper, visitor)
    }

    /// Capture a read-only view of the store as of now. The snapshot keeps
    /// answering from that point in time regardless of later writes,
    /// flushes, or compactions.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let lsn = self.shared.assign_lsn();
        Ok(Snapshot {
            view: self.shared.read_view(lsn)?,
        })
    }

    /// Best-effort removal of table files no version references.
    pub fn garbage_collect(&self) -> Result<()> {
        self.shared.versions.garbage_collect()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.worker_state.lock() {
            state.shutdown = true;
        }
        self.shared.worker_signal.notify_all();
        self.shared.flush_signal.notify_all();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// A read-only view of the store at a fixed LSN.
pub struct Snapshot {
    view: ReadView,
}

impl Snapshot {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        self.view.get(key)
    }

    pub fn range_scan(
        &self,
        lower: &[u8],
        upper: &[u8],
        visitor: impl FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        check_key(lower)?;
        check_key(upper)?;
        self.view.visit(lower, upper, visitor)
    }
}

impl Shared {
    fn assign_lsn(&self) -> u64 {
        self.next_lsn.fetch_add(1, Ordering::SeqCst)
    }

    fn schedule_worker(&self) {
        let mut state = self.worker_state.lock().expect("worker state poisoned");
        if !state.scheduled {
            state.scheduled = true;
            self.worker_signal.notify_one();
        }
    }

    /// Rotate the log and park the frozen memtable once the log passes the
    /// threshold. Blocks while a previous immutable memtable is still being
    /// flushed; a second rotation cannot begin until the worker clears it.
    fn maybe_rotate(&self) -> Result<()> {
        while self.log.size() >= self.config.max_log_size {
            // Read the flush generation before inspecting the slot so a
            // clear that races past us still bumps past this value.
            let flush_gen = self.worker_state.lock()?.flushes_done;
            {
                let mut pair = self.mem.write()?;
                if self.log.size() < self.config.max_log_size {
                    return Ok(());
                }
                if pair.immutable.is_none() {
                    // The exclusive pair lock is the writer fence: no append
                    // can run while it is held, so the log can rotate before
                    // the freeze. A failed rotation then leaves the memtable
                    // writable and the store merely retries later.
                    self.log.rotate()?;
                    pair.mutable.freeze()?;
                    let frozen =
                        std::mem::replace(&mut pair.mutable, Arc::new(Memtable::new()));
                    pair.immutable = Some(frozen);
                    drop(pair);
                    self.schedule_worker();
                    return Ok(());
                }
            }

            let mut state = self.worker_state.lock()?;
            while state.flushes_done == flush_gen && !state.shutdown {
                state = self.flush_signal.wait(state)?;
            }
            if state.shutdown {
                return Err(Error::Internal("engine is shutting down".to_string()));
            }
        }
        Ok(())
    }

    /// Capture the layers a read at `lsn` consults. The memtable handles and
    /// the version are taken under the shared pair lock: the worker only
    /// clears the immutable slot (exclusively) after publishing the version
    /// that contains its data, so the view never has a gap.
    fn read_view(&self, lsn: u64) -> Result<ReadView> {
        let pair = self.mem.read()?;
        Ok(ReadView {
            lsn,
            mutable: Arc::clone(&pair.mutable),
            immutable: pair.immutable.clone(),
            version: self.versions.latest(),
        })
    }

    /// Flush the parked immutable memtable, if any: install its tables,
    /// drop `imm.log`, clear the slot, and release stalled writers.
    fn flush_step(&self) -> Result<()> {
        let immutable = self.mem.read()?.immutable.clone();
        let Some(immutable) = immutable else {
            return Ok(());
        };

        if !immutable.is_empty() {
            self.versions.install_flush(&immutable)?;
        }
        self.log.drop_imm()?;
        self.mem.write()?.immutable = None;

        let mut state = self.worker_state.lock()?;
        state.flushes_done += 1;
        drop(state);
        self.flush_signal.notify_all();
        Ok(())
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (work, quit) = {
            let mut state = shared.worker_state.lock().expect("worker state poisoned");
            while !state.scheduled && !state.shutdown {
                state = shared
                    .worker_signal
                    .wait(state)
                    .expect("worker state poisoned");
            }
            let work = state.scheduled;
            state.scheduled = false;
            (work, state.shutdown)
        };

        if work {
            if let Err(err) = shared.flush_step() {
                tracing::error!(error = %err, "memtable flush failed; will retry on next trigger");
            }
            match shared.versions.maybe_compact() {
                Ok(true) => tracing::debug!("compaction step completed"),
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(error = %err, "compaction failed; will retry on next trigger");
                }
            }
        }

        if quit {
            let state = shared.worker_state.lock().expect("worker state poisoned");
            if !state.scheduled {
                break;
            }
        }
    }
}

/// The three layers a read consults, pinned at capture time. Memtables only
/// grow and versions are immutable, so the view answers identically forever.
struct ReadView {
    lsn: u64,
    mutable: Arc<Memtable>,
    immutable: Option<Arc<Memtable>>,
    version: Arc<Version>,
}

impl ReadView {
    fn lookup(&self, key: &[u8]) -> Result<Option<Lookup>> {
        if let Some(found) = self.mutable.point_get(key, self.lsn)? {
            return Ok(Some(found));
        }
        if let Some(immutable) = &self.immutable {
            if let Some(found) = immutable.point_get(key, self.lsn)? {
                return Ok(Some(found));
            }
        }
        self.version.point_get(&TaggedKey::new(key, self.lsn))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.lookup(key)? {
            Some(Lookup::Live(value)) => Ok(Some(value)),
            Some(Lookup::Tombstone) | None => Ok(None),
        }
    }

    /// Merge all three layers and emit the visible live winner per user key.
    fn visit(
        &self,
        lower: &[u8],
        upper: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]),
    ) -> Result<()> {
        if lower > upper {
            return Ok(());
        }

        let mut sources: Vec<RecordIterator> = Vec::new();
        let mem_winners = self.mutable.range_scan(lower, upper, self.lsn)?;
        sources.push(Box::new(mem_winners.into_iter().map(Ok)));
        if let Some(immutable) = &self.immutable {
            let imm_winners = immutable.range_scan(lower, upper, self.lsn)?;
            sources.push(Box::new(imm_winners.into_iter().map(Ok)));
        }
        sources.extend(self.version.range_sources(lower, upper)?);

        let merge = MergeIterator::new(sources)?;
        let mut winner: Option<Record> = None;
        for record in merge {
            let record = record?;
            if record.key.user_key.as_slice() > upper {
                break;
            }
            if record.key.lsn > self.lsn {
                continue;
            }
            match &winner {
                Some(current) if current.key.user_key == record.key.user_key => {
                    // Same user key, higher LSN: the merge is ordered, so
                    // this record supersedes the current winner.
                    winner = Some(record);
                }
                Some(current) => {
                    if !current.value.deleted {
                        visitor(&current.key.user_key, &current.value.value);
                    }
                    winner = Some(record);
                }
                None => winner = Some(record),
            }
        }
        if let Some(current) = winner {
            if !current.value.deleted {
                visitor(&current.key.user_key, &current.value.value);
            }
        }
        Ok(())
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(crate::errinput!(
            "key length {} outside 1..={MAX_KEY_SIZE}",
            key.len()
        ));
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<()> {
    if value.is_empty() || value.len() > MAX_VALUE_SIZE {
        return Err(crate::errinput!(
            "value length {} outside 1..={MAX_VALUE_SIZE}",
            value.len()
        ));
    }
    Ok(())
}
