//! An embedded LSM-tree key-value store.
//!
//! emberdb is a single-process, durable, ordered byte-string store with MVCC
//! snapshot reads, range scans, and background leveled compaction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌───────────────────┐
//! │ Mutable memtable │◄──┤ Immutable memtable│
//! │  (16 shards)     │   │  (flush pending)  │
//! └──────────────────┘   └───────────────────┘
//!         │                        │
//!         ▼                        ▼
//!    ┌─────────┐            ┌─────────────┐
//!    │ mem.log │            │   Level 0   │ ← flushes (may overlap)
//!    └─────────┘            └─────────────┘
//!                                  │
//!                                  ▼
//!                           ┌─────────────┐
//!                           │   Level 1+  │ ← compaction (sorted, disjoint)
//!                           └─────────────┘
//! ```
//!
//! # Data flow
//!
//! Every write appends to the write-ahead log and lands in the mutable
//! memtable under one monotonically increasing LSN. When the log passes its
//! threshold the memtable freezes, the log rotates, and a background worker
//! converts the frozen table into level-0 table files and merges tables down
//! the levels. Reads capture an LSN as their view and consult memtables
//! first, then the current table version; per user key, the record with the
//! greatest LSN at or below the view wins, and tombstones shadow older data.
//!
//! # Durability
//!
//! Writes are durable after [`Engine::sync`] returns. Recovery replays the
//! manifest, then the rotated log, then the current log; a torn tail from a
//! crash truncates to the last complete record.
//!
//! # Example
//!
//! ```no_run
//! use emberdb::{Engine, EngineConfig};
//!
//! # fn main() -> emberdb::Result<()> {
//! let engine = Engine::open("./db", EngineConfig::default())?;
//! engine.put(b"key", b"value")?;
//! engine.sync()?;
//! assert_eq!(engine.get(b"key")?, Some(b"value".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod iterator;
pub mod log;
pub mod manifest;
pub mod memtable;
pub mod record;
pub mod sstable;
pub mod storage;
pub mod version;

pub use config::EngineConfig;
pub use engine::{Engine, Snapshot};
pub use error::{Error, Result};
