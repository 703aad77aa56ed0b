//! Interned per-path reader/writer locks.
//!
//! Every file-level critical section takes a lock keyed by the literal path
//! string, so operations on distinct paths proceed in parallel. Entries are
//! reference counted by an active-holder count and garbage collected by a
//! background sweeper: an entry with zero active holders can be removed
//! because the next acquirer constructs a fresh one and no existing holder
//! can still reference it.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// How often the sweeper removes idle lock entries.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct PathLock {
    rw: Arc<RwLock<()>>,
    active: AtomicI64,
}

impl PathLock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rw: Arc::new(RwLock::new(())),
            active: AtomicI64::new(0),
        })
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }
}

/// Exclusive hold on one path. Dropping it releases the lock and then
/// retires the holder count, in that order.
pub(crate) struct PathWriteGuard {
    guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
    lock: Arc<PathLock>,
}

impl Drop for PathWriteGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.lock.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared hold on one path. Dropping it releases the lock and then retires
/// the holder count, in that order.
pub(crate) struct PathReadGuard {
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
    lock: Arc<PathLock>,
}

impl Drop for PathReadGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.lock.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Shared {
    entries: Mutex<HashMap<PathBuf, Arc<PathLock>>>,
    stop: Mutex<bool>,
    stop_cond: Condvar,
}

impl Shared {
    fn purge(&self) {
        self.entries.lock().retain(|_, lock| lock.is_active());
    }
}

/// The path lock table. Owned by the database; never fails, only blocks.
pub(crate) struct PathLocks {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PathLocks {
    /// Creates the table and starts its background sweeper.
    pub(crate) fn new() -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            stop: Mutex::new(false),
            stop_cond: Condvar::new(),
        });
        let sweeper = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || loop {
                let mut stop = shared.stop.lock();
                if *stop {
                    break;
                }
                let _ = shared.stop_cond.wait_for(&mut stop, CLEANUP_INTERVAL);
                if *stop {
                    break;
                }
                drop(stop);
                shared.purge();
            })
        };
        Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Interns the entry for `path` and registers one more active holder.
    /// The table mutex is released before the per-entry lock is acquired.
    fn intern(&self, path: &Path) -> Arc<PathLock> {
        let mut entries = self.shared.entries.lock();
        let lock = entries
            .entry(path.to_path_buf())
            .or_insert_with(PathLock::new)
            .clone();
        lock.active.fetch_add(1, Ordering::AcqRel);
        lock
    }

    /// Takes the exclusive lock for `path`, blocking as needed.
    pub(crate) fn lock(&self, path: &Path) -> PathWriteGuard {
        let lock = self.intern(path);
        let guard = lock.rw.write_arc();
        PathWriteGuard {
            guard: Some(guard),
            lock,
        }
    }

    /// Takes the shared lock for `path`, blocking as needed.
    pub(crate) fn read(&self, path: &Path) -> PathReadGuard {
        let lock = self.intern(path);
        let guard = lock.rw.read_arc();
        PathReadGuard {
            guard: Some(guard),
            lock,
        }
    }

    /// Number of interned entries. Test hook.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Stops the sweeper and spins until every entry has been released.
    pub(crate) fn close(&self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
            self.shared.stop_cond.notify_all();
        }
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
        loop {
            self.shared.purge();
            if self.shared.entries.lock().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        debug!("path lock table drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn distinct_paths_do_not_contend() {
        let locks = PathLocks::new();
        let _a = locks.lock(Path::new("/a"));
        let _b = locks.lock(Path::new("/b"));
        assert_eq!(locks.len(), 2);
        locks.close();
    }

    #[test]
    fn same_path_is_exclusive() {
        let locks = Arc::new(PathLocks::new());
        let guard = locks.lock(Path::new("/k"));
        let hits = Arc::new(AtomicUsize::new(0));

        let t = {
            let locks = Arc::clone(&locks);
            let hits = Arc::clone(&hits);
            thread::spawn(move || {
                let _g = locks.lock(Path::new("/k"));
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(guard);
        t.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        locks.close();
    }

    #[test]
    fn readers_share() {
        let locks = PathLocks::new();
        let _r1 = locks.read(Path::new("/k"));
        let _r2 = locks.read(Path::new("/k"));
        assert_eq!(locks.len(), 1);
        drop(_r1);
        drop(_r2);
        locks.close();
    }

    #[test]
    fn purge_removes_idle_entries() {
        let locks = PathLocks::new();
        {
            let _g = locks.lock(Path::new("/k"));
            locks.shared.purge();
            assert_eq!(locks.len(), 1, "held entries survive a sweep");
        }
        locks.shared.purge();
        assert_eq!(locks.len(), 0);
        locks.close();
    }

    #[test]
    fn close_blocks_until_released() {
        let locks = Arc::new(PathLocks::new());
        let guard = locks.lock(Path::new("/k"));

        let t = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                drop(guard);
                let _ = locks;
            })
        };

        locks.close();
        assert_eq!(locks.len(), 0);
        t.join().unwrap();
    }
}
