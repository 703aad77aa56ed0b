//! Reference-counted open-file cache.
//!
//! All concurrent readers of one path share a single OS handle and read
//! through positional I/O, so they see independent byte streams without a
//! shared seek cursor. The handle is opened lazily by the first reader,
//! counted with an `i16`, and closed when the last reader returns, at which
//! point the entry is dropped from the table.

use crate::db::{Permit, Semaphore};
use crate::error::{Error, Result};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

#[derive(Default)]
pub(crate) struct FileState {
    file: Option<Arc<File>>,
    stat: Option<fs::Metadata>,
    readers: i16,
    permit: Option<Permit>,
}

/// One cached path: the shared OS handle (if any readers are live), the most
/// recently observed stat, and the reader count.
pub(crate) struct FileEntry {
    path: PathBuf,
    owner: Weak<FilesShared>,
    state: Arc<Mutex<FileState>>,
}

impl FileEntry {
    fn new(path: PathBuf, owner: Weak<FilesShared>) -> Arc<Self> {
        Arc::new(Self {
            path,
            owner,
            state: Arc::new(Mutex::new(FileState::default())),
        })
    }

    /// Hands out one positional reader, opening the OS handle if this is the
    /// first. `ENOENT` evicts the entry and surfaces as does-not-exist.
    fn reader(self: &Arc<Self>, sem: &Semaphore) -> Result<Reader> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            let permit = sem.acquire().ok_or(Error::Closing)?;
            let file = match File::open(&self.path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    drop(state);
                    Self::evict(self);
                    return Err(Error::DoesNotExist);
                }
                Err(err) => return Err(err.into()),
            };
            let stat = file.metadata()?;
            state.file = Some(Arc::new(file));
            state.stat = Some(stat);
            state.permit = Some(permit);
        }
        if state.readers == i16::MAX {
            return Err(Error::NoReaders);
        }
        let file = state.file.clone().ok_or(Error::NoReaders)?;
        let stat = state.stat.clone().ok_or(Error::NoReaders)?;
        state.readers += 1;
        Ok(Reader {
            entry: Arc::clone(self),
            file,
            stat,
            offset: 0,
        })
    }

    /// Retires one reader; the last one out closes the handle and removes
    /// the entry from the table.
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            state.file = None;
            state.permit = None;
            drop(state);
            Self::evict(self);
        }
    }

    /// Removes this entry from its table, unless the table already holds a
    /// newer entry for the same path.
    fn evict(entry: &Arc<Self>) {
        if let Some(owner) = entry.owner.upgrade() {
            let mut entries = owner.entries.write();
            if let Some(current) = entries.get(&entry.path) {
                if Arc::ptr_eq(current, entry) {
                    entries.remove(&entry.path);
                }
            }
        }
    }
}

/// Exclusive hold on a cache entry, used by the cross-bucket rename to park
/// readers of the destination until the rename lands.
pub(crate) type EntryGuard = ArcMutexGuard<RawMutex, FileState>;

struct FilesShared {
    entries: RwLock<HashMap<PathBuf, Arc<FileEntry>>>,
    sem: Semaphore,
}

/// The per-bucket open-file table.
pub(crate) struct Files {
    shared: Arc<FilesShared>,
}

impl Files {
    pub(crate) fn new(sem: Semaphore) -> Self {
        Self {
            shared: Arc::new(FilesShared {
                entries: RwLock::new(HashMap::new()),
                sem,
            }),
        }
    }

    fn intern(&self, path: &Path) -> Arc<FileEntry> {
        {
            let entries = self.shared.entries.read();
            if let Some(entry) = entries.get(path) {
                return Arc::clone(entry);
            }
        }
        let mut entries = self.shared.entries.write();
        // Double-check: it could have been interned between the locks.
        if let Some(entry) = entries.get(path) {
            return Arc::clone(entry);
        }
        let entry = FileEntry::new(path.to_path_buf(), Arc::downgrade(&self.shared));
        entries.insert(path.to_path_buf(), Arc::clone(&entry));
        entry
    }

    /// Returns a fresh positional reader over `path`, sharing the OS handle
    /// with all other live readers of the same path.
    pub(crate) fn get(&self, path: &Path) -> Result<Reader> {
        let entry = self.intern(path);
        entry.reader(&self.shared.sem)
    }

    /// Installs (or reuses) the entry for `path` and returns its state
    /// guard, held by the caller for the duration of a rename. Fails with
    /// `KeyExists` when an entry is already present and `overwrite` is off.
    pub(crate) fn place(&self, path: &Path, overwrite: bool) -> Result<EntryGuard> {
        let entry = {
            let mut entries = self.shared.entries.write();
            match entries.get(path) {
                Some(_) if !overwrite => return Err(Error::KeyExists),
                Some(entry) => Arc::clone(entry),
                None => {
                    let entry =
                        FileEntry::new(path.to_path_buf(), Arc::downgrade(&self.shared));
                    entries.insert(path.to_path_buf(), Arc::clone(&entry));
                    entry
                }
            }
        };
        Ok(entry.state.lock_arc())
    }

    /// Drops the entry for `path` from the table. Live readers keep their
    /// handle to the old inode until they close.
    pub(crate) fn delete(&self, path: &Path) {
        self.shared.entries.write().remove(path);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shared.entries.read().len()
    }
}

/// A positional cursor over a cached open file.
///
/// Dropping the reader retires its reference; the last reader closes the
/// underlying OS handle.
pub(crate) struct Reader {
    entry: Arc<FileEntry>,
    file: Arc<File>,
    stat: fs::Metadata,
    offset: u64,
}

impl Reader {
    /// The stat captured when the handle was opened.
    pub(crate) fn stat(&self) -> &fs::Metadata {
        &self.stat
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").field("offset", &self.offset).finish_non_exhaustive()
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.entry.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn fixture(contents: &[u8]) -> (TempDir, PathBuf, Files) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value");
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        (dir, path, Files::new(Semaphore::new(16)))
    }

    fn read_all(r: &mut Reader) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn readers_share_one_entry() {
        let (_dir, path, files) = fixture(b"hello");
        let mut a = files.get(&path).unwrap();
        let mut b = files.get(&path).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(read_all(&mut a), b"hello");
        assert_eq!(read_all(&mut b), b"hello");
        drop(a);
        assert_eq!(files.len(), 1, "entry lives while a reader is out");
        drop(b);
        assert_eq!(files.len(), 0, "last reader closes and evicts");
    }

    #[test]
    fn offsets_are_independent() {
        let (_dir, path, files) = fixture(b"abcdef");
        let mut a = files.get(&path).unwrap();
        let mut b = files.get(&path).unwrap();
        let mut buf = [0u8; 3];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc", "second reader starts at zero");
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn missing_file_is_does_not_exist() {
        let dir = TempDir::new().unwrap();
        let files = Files::new(Semaphore::new(16));
        let err = files.get(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::DoesNotExist));
        assert_eq!(files.len(), 0, "stale entry is dropped");
    }

    #[test]
    fn stat_reports_size() {
        let (_dir, path, files) = fixture(b"12345");
        let r = files.get(&path).unwrap();
        assert_eq!(r.stat().len(), 5);
    }

    #[test]
    fn delete_keeps_live_readers_working() {
        let (_dir, path, files) = fixture(b"payload");
        let mut r = files.get(&path).unwrap();
        files.delete(&path);
        fs::remove_file(&path).unwrap();
        assert_eq!(read_all(&mut r), b"payload");
    }

    #[test]
    fn place_respects_overwrite() {
        let (_dir, path, files) = fixture(b"x");
        let r = files.get(&path).unwrap();
        assert!(matches!(files.place(&path, false), Err(Error::KeyExists)));
        drop(r);
        let guard = files.place(&path, false).unwrap();
        drop(guard);
    }

    #[test]
    fn open_handles_consume_permits() {
        let (_dir, path, files) = fixture(b"x");
        let sem = files.shared.sem.clone();
        assert_eq!(sem.in_use(), 0);
        let a = files.get(&path).unwrap();
        let b = files.get(&path).unwrap();
        assert_eq!(sem.in_use(), 1, "one handle, one permit");
        drop(a);
        drop(b);
        assert_eq!(sem.in_use(), 0);
    }
}
