//! The database façade: options, lifecycle, and the open-files semaphore.

use crate::bucket::Bucket;
use crate::error::Result;
use crate::expiry::ExpiryQueue;
use crate::group::Group;
use crate::keys::{self, InvalidName};
use crate::locks::PathLocks;
use crate::mw::Middleware;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default bound on concurrently open value files.
pub const DEFAULT_MAX_OPEN_FILES: i32 = 1024;

/// Database construction options.
#[derive(Clone, Default)]
pub struct Options {
    /// Default middleware list handed to [`Db::group`] when called with an
    /// empty list.
    pub middleware: Vec<Arc<dyn Middleware>>,

    /// Bound on concurrently open value files. `0` uses the default of
    /// 1024; `-1` derives the bound from the process file-descriptor
    /// rlimit minus 100.
    pub max_open_files: i32,

    /// Store user keys verbatim as filenames instead of base64-encoding
    /// them. Keys are validated; an invalid key is a programmer error and
    /// panics.
    pub plain_file_names: bool,
}

struct SemState {
    in_use: usize,
    closed: bool,
}

struct SemInner {
    state: Mutex<SemState>,
    cond: Condvar,
    capacity: usize,
}

/// Bounded counting semaphore gating every read/write pipeline.
#[derive(Clone)]
pub(crate) struct Semaphore {
    inner: Arc<SemInner>,
}

/// One slot of the open-files semaphore; released on drop.
pub(crate) struct Permit {
    inner: Arc<SemInner>,
}

impl Semaphore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SemInner {
                state: Mutex::new(SemState {
                    in_use: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Takes one slot, blocking while all are in use. Returns `None` once
    /// the semaphore has been closed.
    pub(crate) fn acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        if state.in_use >= self.inner.capacity {
            warn!(
                "reached max number of open files ({}), blocking",
                self.inner.capacity
            );
            while state.in_use >= self.inner.capacity && !state.closed {
                self.inner.cond.wait(&mut state);
            }
            if state.closed {
                return None;
            }
        }
        state.in_use += 1;
        Some(Permit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Slots currently held.
    pub(crate) fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    /// Refuses new acquisitions and blocks until every slot is returned.
    pub(crate) fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.cond.notify_all();
        while state.in_use > 0 {
            self.inner.cond.wait(&mut state);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.in_use -= 1;
        self.inner.cond.notify_all();
    }
}

/// State shared by the database and every bucket in its tree.
pub(crate) struct DbCore {
    pub(crate) root_path: PathBuf,
    pub(crate) locks: PathLocks,
    pub(crate) sem: Semaphore,
    pub(crate) expiry: ExpiryQueue,
    options: Options,
    closed: AtomicBool,
}

impl DbCore {
    /// Maps a user key to its on-disk filename.
    pub(crate) fn encode_key(&self, key: &str) -> String {
        if self.options.plain_file_names {
            keys::check_valid_key(key);
            key.to_string()
        } else {
            keys::encode_name(key)
        }
    }

    /// Maps an on-disk filename back to a user key. Fails for foreign
    /// files so directory reloads can skip them.
    pub(crate) fn decode_key(&self, name: &str) -> std::result::Result<String, InvalidName> {
        if self.options.plain_file_names {
            keys::validate_plain(name)?;
            Ok(name.to_string())
        } else {
            keys::decode_name(name)
        }
    }
}

/// A filesystem-backed blob database.
///
/// The database owns a root bucket at its directory, a process-wide path
/// lock table, and the background threads for lock GC and key expiry.
/// Dropping the handle closes it.
pub struct Db {
    core: Arc<DbCore>,
    root: Bucket,
}

impl Db {
    /// Opens the database at `path`, creating the directory tree as
    /// needed, and rebuilds every bucket index from disk. Keys that
    /// expired while the database was closed are deleted during the
    /// rebuild.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Db> {
        let root_path = path.as_ref().to_path_buf();
        let max_open = match options.max_open_files {
            0 => DEFAULT_MAX_OPEN_FILES as usize,
            -1 => keys::rlimit_max_open(DEFAULT_MAX_OPEN_FILES as usize)
                .saturating_sub(100)
                .max(1),
            n if n > 0 => n as usize,
            _ => DEFAULT_MAX_OPEN_FILES as usize,
        };
        let core = Arc::new(DbCore {
            root_path: root_path.clone(),
            locks: PathLocks::new(),
            sem: Semaphore::new(max_open),
            expiry: ExpiryQueue::new(),
            options,
            closed: AtomicBool::new(false),
        });
        let root = match Bucket::create("", &root_path, Arc::clone(&core)) {
            Ok(root) => root,
            Err(err) => {
                core.expiry.close();
                core.locks.close();
                return Err(err);
            }
        };
        debug!("opened database at {}", root_path.display());
        Ok(Db { core, root })
    }

    /// Descends to a bucket; an empty slice returns the root bucket.
    pub fn bucket(&self, names: &[&str]) -> Option<Bucket> {
        self.root.bucket(names)
    }

    /// Creates (or reuses) a nested bucket under the root.
    pub fn create_bucket(&self, names: &[&str]) -> Result<Bucket> {
        self.root.create_bucket(names)
    }

    /// Wraps the root bucket in a group. An empty list falls back to the
    /// default middleware list from [`Options`].
    pub fn group(&self, middlewares: Vec<Arc<dyn Middleware>>) -> Group {
        if middlewares.is_empty() {
            self.root.group(self.core.options.middleware.clone())
        } else {
            self.root.group(middlewares)
        }
    }

    /// Exports the whole database as a tape archive written to `w`.
    pub fn export<W: Write>(&self, w: W) -> Result<()> {
        self.root.export(w)
    }

    /// Exports the whole database to a file, gzip-compressing it when the
    /// file name ends in `gz`.
    pub fn export_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let gzipped = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("gz"));
        if gzipped {
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            self.root.export_into(&mut builder)?;
            let encoder = builder.into_inner()?;
            encoder.finish()?;
        } else {
            let mut builder = tar::Builder::new(file);
            self.root.export_into(&mut builder)?;
            builder.into_inner()?;
        }
        Ok(())
    }

    /// Number of open-file slots currently in use. Returns to zero once
    /// every outstanding operation and reader has finished.
    pub fn num_open_files(&self) -> usize {
        self.core.sem.in_use()
    }

    /// Closes the database: stops the expiry worker, drains the open-file
    /// semaphore, and drains the path lock table. Blocks until in-flight
    /// operations and outstanding readers are done. Idempotent; after the
    /// first call every new operation fails with
    /// [`Error::Closing`](crate::Error::Closing).
    pub fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.expiry.close();
        self.core.sem.close();
        self.core.locks.close();
        debug!("database closed");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn semaphore_counts_and_blocks() {
        let sem = Semaphore::new(2);
        let a = sem.acquire().unwrap();
        let b = sem.acquire().unwrap();
        assert_eq!(sem.in_use(), 2);

        let sem2 = sem.clone();
        let t = thread::spawn(move || {
            let _c = sem2.acquire().unwrap();
            sem2.in_use()
        });
        thread::sleep(Duration::from_millis(50));
        drop(a);
        assert_eq!(t.join().unwrap(), 2);
        drop(b);
        assert_eq!(sem.in_use(), 0);
    }

    #[test]
    fn semaphore_close_refuses_new_permits() {
        let sem = Semaphore::new(1);
        sem.close();
        assert!(sem.acquire().is_none());
    }

    #[test]
    fn semaphore_close_waits_for_drain() {
        let sem = Semaphore::new(1);
        let permit = sem.acquire().unwrap();
        let sem2 = sem.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(permit);
        });
        sem.close();
        assert_eq!(sem.in_use(), 0);
        t.join().unwrap();
        let _ = sem2;
    }
}
