//! Storage shim the engine does all file I/O through.
//!
//! The engine only ever touches regular files inside a single directory, so
//! the surface is deliberately narrow: open, positional read, append, fsync,
//! rename, unlink, list. Two backends implement it: [`DiskStorage`] over the
//! real filesystem and [`MemStorage`], an in-memory map with fault injection
//! for crash-recovery tests.
//!
//! Reads are positional (`read_at`) so a single shared handle serves any
//! number of threads without seek contention.

pub mod disk;
pub mod memory;

pub use disk::DiskStorage;
pub use memory::MemStorage;

use crate::error::Result;

/// How to open a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    pub truncate: bool,
    pub append: bool,
    pub create: bool,
}

impl OpenMode {
    /// Read-only; the file must exist.
    pub fn read() -> Self {
        Self::default()
    }

    /// Append to the end, creating the file if absent.
    pub fn append() -> Self {
        Self {
            append: true,
            create: true,
            ..Self::default()
        }
    }

    /// Create or truncate, then write from the start.
    pub fn truncate() -> Self {
        Self {
            truncate: true,
            create: true,
            ..Self::default()
        }
    }
}

/// An open file handle. All writes go to the end of the file.
pub trait StorageFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Append `buf` to the end of the file.
    fn append(&self, buf: &[u8]) -> Result<()>;

    /// Current file size in bytes.
    fn len(&self) -> Result<u64>;

    /// Flush all previously written bytes to a crash-durable level.
    fn sync(&self) -> Result<()>;

    /// Read exactly `buf.len()` bytes at `offset`, failing on a short read.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.read_at(offset + read as u64, &mut buf[read..])?;
            if n == 0 {
                return Err(crate::error::Error::IO(format!(
                    "short read: wanted {} bytes at offset {}, got {}",
                    buf.len(),
                    offset,
                    read
                )));
            }
            read += n;
        }
        Ok(())
    }
}

/// A directory of regular files.
pub trait Storage: Send + Sync {
    /// Open `name` inside the directory.
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn StorageFile>>;

    /// Whether `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// Atomically rename `from` to `to`, replacing any existing `to`.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove `name`.
    fn unlink(&self, name: &str) -> Result<()>;

    /// List all file names in the directory.
    fn list(&self) -> Result<Vec<String>>;
}
