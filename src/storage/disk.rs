use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{OpenMode, Storage, StorageFile};
use crate::error::Result;

/// Filesystem-backed storage rooted at a single directory.
pub struct DiskStorage {
    dir: PathBuf,
}

impl DiskStorage {
    /// Open the directory, creating it if absent.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Storage for DiskStorage {
    fn open(&self, name: &str, mode: OpenMode) -> Result<Box<dyn StorageFile>> {
        let mut opts = File::options();
        opts.read(true);
        if mode.truncate {
            opts.write(true).truncate(true);
        }
        if mode.append {
            // Positional writes track the tail themselves; O_APPEND would
            // make pwrite ignore the offset on Linux.
            opts.write(true);
        }
        if mode.create {
            opts.create(true);
        }
        let file = opts.open(self.path(name))?;
        let len = file.metadata()?.len();
        Ok(Box::new(DiskFile {
            file,
            tail: Mutex::new(len),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(fs::rename(self.path(from), self.path(to))?)
    }

    fn unlink(&self, name: &str) -> Result<()> {
        Ok(fs::remove_file(self.path(name))?)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

struct DiskFile {
    file: File,
    /// Current end of file. Appends serialize on this lock so the size seen
    /// by `len()` never runs ahead of written data.
    tail: Mutex<u64>,
}

impl StorageFile for DiskFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn append(&self, buf: &[u8]) -> Result<()> {
        let mut tail = self.tail.lock()?;
        self.file.write_all_at(buf, *tail)?;
        *tail += buf.len() as u64;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(*self.tail.lock()?)
    }

    fn sync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}
