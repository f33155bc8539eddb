use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{OpenMode, Storage, StorageFile};
use crate::error::{Error, Result};

/// In-memory storage with fault injection.
///
/// Every file keeps two images: the volatile one that reads and writes touch,
/// and the durable one that `sync` copies into. [`MemStorage::crash`] throws
/// away everything volatile, simulating power loss at an arbitrary point.
/// Namespace operations (create, rename, unlink) are treated as immediately
/// durable; only file contents are subject to loss.
#[derive(Default)]
pub struct MemStorage {
    files: Mutex<HashMap<String, Arc<MemFile>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all writes that were not followed by a `sync`.
    pub fn crash(&self) {
        let files = self.files.lock().unwrap();
        for file in files.values() {
            let mut images = file.images.lock().unwrap();
            images.volatile = images.durable.clone();
        }
    }
}

impl Storage for MemStorage {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn StorageFile>> {
        let mut files = self.files.lock()?;
        let file = match files.get(name) {
            Some(file) => {
                if mode.truncate {
                    let mut images = file.images.lock()?;
                    images.volatile.clear();
                    images.durable.clear();
                }
                Arc::clone(file)
            }
            None => {
                if !mode.create && !mode.truncate {
                    return Err(Error::IO(format!("no such file: {name}")));
                }
                let file = Arc::new(MemFile::default());
                files.insert(name.to_string(), Arc::clone(&file));
                file
            }
        };
        Ok(Box::new(MemHandle { file }))
    }

    fn exists(&self, name: &str) -> bool {
        self.files.lock().unwrap().contains_key(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.lock()?;
        let file = files
            .remove(from)
            .ok_or_else(|| Error::IO(format!("no such file: {from}")))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn unlink(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock()?;
        files
            .remove(name)
            .ok_or_else(|| Error::IO(format!("no such file: {name}")))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.lock()?.keys().cloned().collect())
    }
}

#[derive(Default)]
struct Images {
    volatile: Vec<u8>,
    durable: Vec<u8>,
}

#[derive(Default)]
struct MemFile {
    images: Mutex<Images>,
}

struct MemHandle {
    file: Arc<MemFile>,
}

impl StorageFile for MemHandle {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let images = self.file.images.lock()?;
        let data = &images.volatile;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn append(&self, buf: &[u8]) -> Result<()> {
        let mut images = self.file.images.lock()?;
        images.volatile.extend_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.images.lock()?.volatile.len() as u64)
    }

    fn sync(&self) -> Result<()> {
        let mut images = self.file.images.lock()?;
        images.durable = images.volatile.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let storage = MemStorage::new();
        let file = storage
            .open("f", OpenMode::append())
            .expect("Failed to open");
        file.append(b"abcdef").expect("Failed to append");

        let mut buf = [0u8; 3];
        file.read_exact_at(3, &mut buf).expect("Failed to read");
        assert_eq!(&buf, b"def");
        assert_eq!(file.read_at(6, &mut buf).expect("read at eof"), 0);
    }

    #[test]
    fn test_crash_discards_unsynced_writes() {
        let storage = MemStorage::new();
        let file = storage
            .open("f", OpenMode::append())
            .expect("Failed to open");

        file.append(b"durable").expect("Failed to append");
        file.sync().expect("Failed to sync");
        file.append(b" lost").expect("Failed to append");

        storage.crash();

        assert_eq!(file.len().expect("Failed to get length"), 7);
        let mut buf = [0u8; 7];
        file.read_exact_at(0, &mut buf).expect("Failed to read");
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn test_crash_empties_never_synced_file() {
        let storage = MemStorage::new();
        let file = storage
            .open("f", OpenMode::append())
            .expect("Failed to open");
        file.append(b"gone").expect("Failed to append");

        storage.crash();
        assert_eq!(file.len().expect("Failed to get length"), 0);
    }

    #[test]
    fn test_rename_and_unlink() {
        let storage = MemStorage::new();
        storage
            .open("a", OpenMode::append())
            .expect("Failed to open")
            .append(b"x")
            .expect("Failed to append");

        storage.rename("a", "b").expect("Failed to rename");
        assert!(!storage.exists("a"));
        assert!(storage.exists("b"));

        storage.unlink("b").expect("Failed to unlink");
        assert!(!storage.exists("b"));
        assert!(storage.unlink("b").is_err());
    }

    #[test]
    fn test_handle_survives_unlink() {
        let storage = MemStorage::new();
        let file = storage
            .open("a", OpenMode::append())
            .expect("Failed to open");
        file.append(b"data").expect("Failed to append");

        storage.unlink("a").expect("Failed to unlink");

        // The open handle still reads its contents, like an unlinked fd.
        let mut buf = [0u8; 4];
        file.read_exact_at(0, &mut buf).expect("Failed to read");
        assert_eq!(&buf, b"data");
    }
}
