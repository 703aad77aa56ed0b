//! Buckets: directories that behave like key/blob maps.
//!
//! A bucket owns one directory. Regular files are values (filenames are the
//! encoded keys), subdirectories are child buckets, and `.meta` is the
//! bucket's metadata sidecar. The in-memory key index maps user keys to
//! their last observed stat; it is rebuilt from the directory on open and
//! kept current by every mutation under the bucket's reader/writer lock.
//!
//! Writes stream through a middleware chain into a temp file and land with
//! an atomic rename; reads stream out of the shared open-file cache. The
//! per-path lock table serialises access per value file, so operations on
//! distinct keys never contend.

use crate::chain::{self, WriterChain};
use crate::db::DbCore;
use crate::error::{Error, Result};
use crate::files::Files;
use crate::group::Group;
use crate::keys;
use crate::locks::PathReadGuard;
use crate::meta::Metadata;
use crate::mw::Middleware;
use num_bigint::BigUint;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub(crate) struct BucketState {
    pub(crate) keys: BTreeMap<String, fs::Metadata>,
    pub(crate) children: BTreeMap<String, Bucket>,
    pub(crate) meta: Metadata,
}

pub(crate) struct BucketShared {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) core: Arc<DbCore>,
    pub(crate) files: Files,
    pub(crate) state: RwLock<BucketState>,
}

/// A directory exposing a key → blob mapping plus nested buckets.
///
/// `Bucket` is a cheap handle; clones share the same underlying state. All
/// operations are safe to call from multiple threads concurrently.
#[derive(Clone)]
pub struct Bucket {
    pub(crate) inner: Arc<BucketShared>,
}

/// A streaming value returned by [`Bucket::get`].
///
/// The reader owns the middleware chain, the open-file cache reference, and
/// the per-path read lock; dropping it releases all three. The lock is held
/// for as long as the caller keeps the reader, so drop it promptly.
pub struct ValueReader {
    reader: Box<dyn Read + Send>,
    stat: fs::Metadata,
    _lock: PathReadGuard,
}

impl ValueReader {
    /// Stat of the underlying value file, captured when it was opened.
    pub fn stat(&self) -> &fs::Metadata {
        &self.stat
    }
}

impl Read for ValueReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Removes the temp file on every exit path; after a successful rename the
/// removal quietly hits nothing.
struct TmpCleanup<'a>(&'a Path);

impl Drop for TmpCleanup<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.0);
    }
}

fn unix_after(d: Duration) -> i64 {
    SystemTime::now()
        .checked_add(d)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Bucket {
    pub(crate) fn from_shared(inner: Arc<BucketShared>) -> Self {
        Self { inner }
    }

    /// Opens (creating as needed) the bucket named `name` under
    /// `parent_path` and rebuilds its index from the directory.
    pub(crate) fn create(name: &str, parent_path: &Path, core: Arc<DbCore>) -> Result<Bucket> {
        let encoded = core.encode_key(name);
        let path = if encoded.is_empty() {
            parent_path.to_path_buf()
        } else {
            parent_path.join(encoded)
        };
        fs::create_dir_all(&path)?;
        let meta = Metadata::load(&path)?;
        let bucket = Bucket {
            inner: Arc::new(BucketShared {
                name: name.to_string(),
                path,
                files: Files::new(core.sem.clone()),
                core,
                state: RwLock::new(BucketState {
                    keys: BTreeMap::new(),
                    children: BTreeMap::new(),
                    meta,
                }),
            }),
        };
        bucket.reload()?;
        Ok(bucket)
    }

    /// Rebuilds the key index and child map from the directory.
    ///
    /// Files whose names do not decode are foreign and skipped. Keys whose
    /// expiry has passed are deleted from disk instead of indexed; this is
    /// the crash-recovery path for timed keys. Metadata entries left behind
    /// by keys that no longer exist are pruned.
    fn reload(&self) -> Result<()> {
        let (file_entries, dir_entries) = keys::ls_dir(&self.inner.path)?;
        let now = keys::unix_now();
        {
            let mut st = self.inner.state.write();
            let mut dirty = false;
            let mut index = BTreeMap::new();
            for (name, stat) in file_entries {
                let Ok(key) = self.inner.core.decode_key(&name) else {
                    continue;
                };
                if let Some(ts) = st.meta.expiry_date(&key) {
                    if ts != 0 && ts <= now {
                        let _ = fs::remove_file(self.inner.path.join(&name));
                        st.meta.remove_key(&key);
                        dirty = true;
                        debug!("expired key swept on reload: {key}");
                        continue;
                    }
                }
                index.insert(key, stat);
            }
            st.keys = index;
            let BucketState { keys, meta, .. } = &mut *st;
            dirty |= meta.retain_known(|key| keys.contains_key(key));
            if dirty {
                if let Err(err) = st.meta.store() {
                    warn!("failed to persist metadata after reload sweep: {err}");
                }
            }
        }
        for name in dir_entries {
            let Ok(child_name) = self.inner.core.decode_key(&name) else {
                continue;
            };
            match Bucket::create(&child_name, &self.inner.path, Arc::clone(&self.inner.core)) {
                Ok(child) => {
                    self.inner
                        .state
                        .write()
                        .children
                        .insert(child_name, child);
                }
                Err(err) => warn!("failed to open child bucket {child_name:?}: {err}"),
            }
        }
        Ok(())
    }

    /// The bucket's display name (the unencoded key it was created under).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bucket's directory on disk.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub(crate) fn key_path(&self, key: &str) -> PathBuf {
        self.inner.path.join(self.inner.core.encode_key(key))
    }

    /// Descends to a nested bucket without creating anything. An empty
    /// slice returns this bucket; a missing segment returns `None`.
    pub fn bucket(&self, names: &[&str]) -> Option<Bucket> {
        let Some((first, rest)) = names.split_first() else {
            return Some(self.clone());
        };
        let child = self.inner.state.read().children.get(*first).cloned()?;
        child.bucket(rest)
    }

    /// Descends to a nested bucket, creating every missing segment.
    /// Existing segments are reused, so repeated calls are idempotent.
    pub fn create_bucket(&self, names: &[&str]) -> Result<Bucket> {
        let Some((first, rest)) = names.split_first() else {
            return Ok(self.clone());
        };
        let child = {
            let mut st = self.inner.state.write();
            match st.children.get(*first) {
                Some(existing) => existing.clone(),
                None => {
                    let target = self.key_path(first);
                    if target.is_file() {
                        return Err(Error::InvalidBucketType);
                    }
                    let child = Bucket::create(
                        first,
                        &self.inner.path,
                        Arc::clone(&self.inner.core),
                    )?;
                    st.children.insert((*first).to_string(), child.clone());
                    child
                }
            }
        };
        child.create_bucket(rest)
    }

    /// Removes a direct child bucket and its directory tree.
    ///
    /// Concurrent operations on the deleted subtree are a programmer
    /// error; no descendant locks are taken.
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        let mut st = self.inner.state.write();
        match st.children.remove(name) {
            Some(child) => {
                fs::remove_dir_all(&child.inner.path)?;
                Ok(())
            }
            None => Err(Error::DoesNotExist),
        }
    }

    /// Streams a value out of the bucket.
    ///
    /// The returned reader holds the per-path read lock until dropped.
    pub fn get(&self, key: &str, middlewares: &[Arc<dyn Middleware>]) -> Result<ValueReader> {
        if !self.inner.state.read().keys.contains_key(key) {
            return Err(Error::DoesNotExist);
        }
        let path = self.key_path(key);
        let lock = self.inner.core.locks.read(&path);
        let reader = self.inner.files.get(&path)?;
        let stat = reader.stat().clone();
        let reader = chain::apply_readers(middlewares, &path, reader)?;
        Ok(ValueReader {
            reader,
            stat,
            _lock: lock,
        })
    }

    /// Copies `reader` into the bucket under `key`.
    pub fn put<R: Read>(
        &self,
        key: &str,
        reader: R,
        middlewares: &[Arc<dyn Middleware>],
    ) -> Result<()> {
        self.put_timed(key, reader, Duration::ZERO, middlewares)
    }

    /// Copies `reader` into the bucket under `key`, expiring it after
    /// `expire_after` (zero means never).
    pub fn put_timed<R: Read>(
        &self,
        key: &str,
        mut reader: R,
        expire_after: Duration,
        middlewares: &[Arc<dyn Middleware>],
    ) -> Result<()> {
        self.put_timed_func(key, expire_after, middlewares, |w| {
            io::copy(&mut reader, w)?;
            Ok(())
        })
    }

    /// Streams a value written by `f` into the bucket under `key`.
    pub fn put_func<F>(
        &self,
        key: &str,
        middlewares: &[Arc<dyn Middleware>],
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        self.put_timed_func(key, Duration::ZERO, middlewares, f)
    }

    /// Streams a value written by `f` into the bucket under `key`, with an
    /// optional expiry.
    ///
    /// The value is written to a temp file through the middleware chain and
    /// atomically renamed over the final path; the rename is the point at
    /// which concurrent readers switch to the new value. On any failure the
    /// temp file is removed and the key index is untouched. The counter
    /// advances only when `key` was previously absent.
    pub fn put_timed_func<F>(
        &self,
        key: &str,
        expire_after: Duration,
        middlewares: &[Arc<dyn Middleware>],
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let _permit = self.inner.core.sem.acquire().ok_or(Error::Closing)?;
        let path = self.key_path(key);
        let tmp = keys::tmp_file_name(&path);
        let _path_lock = self.inner.core.locks.lock(&path);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let _cleanup = TmpCleanup(&tmp);

        let mut chain = WriterChain::new(middlewares, &path, file)?;
        if let Err(err) = f(&mut chain) {
            let _ = chain.close();
            return Err(err);
        }
        chain.close()?;

        let mut st = self.inner.state.write();
        fs::rename(&tmp, &path)?;
        let stat = fs::metadata(&path)?;
        if !st.keys.contains_key(key) {
            st.meta.inc_counter();
        }
        if expire_after > Duration::ZERO {
            st.meta.set_expiry_date(key, unix_after(expire_after));
            self.inner.core.expiry.schedule(
                Instant::now() + expire_after,
                Arc::downgrade(&self.inner),
                key.to_string(),
                stat.modified()?,
            );
        } else {
            // Clears a leftover expiry when the key is overwritten untimed.
            st.meta.set_expiry_date(key, 0);
        }
        st.keys.insert(key.to_string(), stat);
        st.meta.store()
    }

    /// Appends `reader` to the value under `key`, creating it if missing.
    pub fn append<R: Read>(
        &self,
        key: &str,
        mut reader: R,
        middlewares: &[Arc<dyn Middleware>],
    ) -> Result<()> {
        self.append_func(key, middlewares, |w| {
            io::copy(&mut reader, w)?;
            Ok(())
        })
    }

    /// Appends bytes written by `f` to the value under `key`.
    ///
    /// Appends write to the final file directly (no temp file) and clear
    /// any expiry set on the key. The counter advances only on first
    /// insert.
    pub fn append_func<F>(
        &self,
        key: &str,
        middlewares: &[Arc<dyn Middleware>],
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let _permit = self.inner.core.sem.acquire().ok_or(Error::Closing)?;
        let path = self.key_path(key);
        let _path_lock = self.inner.core.locks.lock(&path);

        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        let mut chain = WriterChain::new(middlewares, &path, file)?;
        if let Err(err) = f(&mut chain) {
            let _ = chain.close();
            return Err(err);
        }
        chain.close()?;

        let mut st = self.inner.state.write();
        if !st.keys.contains_key(key) {
            st.meta.inc_counter();
        }
        let stat = fs::metadata(&path)?;
        st.keys.insert(key.to_string(), stat);
        st.meta.set_expiry_date(key, 0);
        st.meta.store()
    }

    /// Hands the value to `f`, then deletes the key.
    ///
    /// The file is removed only after `f` returns success; an error from
    /// `f` leaves the value in place and is surfaced.
    pub fn get_and_delete<F>(
        &self,
        key: &str,
        middlewares: &[Arc<dyn Middleware>],
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn Read) -> Result<()>,
    {
        if !self.inner.state.read().keys.contains_key(key) {
            return Err(Error::DoesNotExist);
        }
        let path = self.key_path(key);
        let _path_lock = self.inner.core.locks.lock(&path);

        let reader = self.inner.files.get(&path)?;
        let mut reader = chain::apply_readers(middlewares, &path, reader)?;
        f(&mut *reader)?;
        drop(reader);

        let mut st = self.inner.state.write();
        let removed = fs::remove_file(&path);
        st.keys.remove(key);
        st.meta.remove_key(key);
        drop(st);
        self.inner.files.delete(&path);
        removed.map_err(Into::into)
    }

    /// Hands the value to `f`, then atomically moves it to `new_key` in
    /// `dst` (which may be this bucket).
    ///
    /// With `overwrite` off, a destination key that is currently live in
    /// the cache fails with [`Error::KeyExists`]. Destination locks are
    /// always taken before source locks, and a source that resolves to the
    /// destination path fails with [`Error::SamePath`] up front.
    pub fn get_and_rename<F>(
        &self,
        key: &str,
        dst: &Bucket,
        new_key: &str,
        overwrite: bool,
        middlewares: &[Arc<dyn Middleware>],
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn Read) -> Result<()>,
    {
        if !self.inner.state.read().keys.contains_key(key) {
            return Err(Error::DoesNotExist);
        }
        let _permit = self.inner.core.sem.acquire().ok_or(Error::Closing)?;

        let src_path = self.key_path(key);
        let dst_path = dst.key_path(new_key);
        if src_path == dst_path {
            return Err(Error::SamePath);
        }
        let _dst_lock = self.inner.core.locks.lock(&dst_path);
        let _src_lock = self.inner.core.locks.lock(&src_path);

        let reader = self.inner.files.get(&src_path)?;
        let mut reader = chain::apply_readers(middlewares, &src_path, reader)?;

        // Park future readers of the destination on its cache entry until
        // the rename lands.
        let _entry_guard = {
            let _dst_state = dst.inner.state.write();
            dst.inner.files.place(&dst_path, overwrite)?
        };

        f(&mut *reader)?;
        drop(reader);

        if Arc::ptr_eq(&self.inner, &dst.inner) {
            let mut st = self.inner.state.write();
            fs::rename(&src_path, &dst_path)?;
            let stat = fs::metadata(&dst_path)?;
            st.keys.remove(key);
            st.meta.remove_key(key);
            if !st.keys.contains_key(new_key) {
                st.meta.inc_counter();
            }
            st.keys.insert(new_key.to_string(), stat);
        } else {
            // Destination bucket first, matching the path-lock order above.
            let mut dst_st = dst.inner.state.write();
            let mut src_st = self.inner.state.write();
            fs::rename(&src_path, &dst_path)?;
            let stat = fs::metadata(&dst_path)?;
            src_st.keys.remove(key);
            src_st.meta.remove_key(key);
            if !dst_st.keys.contains_key(new_key) {
                dst_st.meta.inc_counter();
            }
            dst_st.keys.insert(new_key.to_string(), stat);
        }
        self.inner.files.delete(&src_path);
        Ok(())
    }

    /// Renames `key` to `new_key` within this bucket. An existing value at
    /// `new_key` is replaced; the counter does not advance.
    pub fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        if !self.inner.state.read().keys.contains_key(key) {
            return Err(Error::DoesNotExist);
        }
        let old_path = self.key_path(key);
        let new_path = self.key_path(new_key);
        if old_path == new_path {
            return Err(Error::SamePath);
        }
        let _new_lock = self.inner.core.locks.lock(&new_path);
        let _old_lock = self.inner.core.locks.lock(&old_path);

        let mut st = self.inner.state.write();
        if !st.keys.contains_key(key) {
            return Err(Error::DoesNotExist);
        }
        fs::rename(&old_path, &new_path)?;
        st.keys.remove(key);
        st.meta.remove_key(key);
        let stat = fs::metadata(&new_path)?;
        st.keys.insert(new_key.to_string(), stat);
        drop(st);
        self.inner.files.delete(&old_path);
        Ok(())
    }

    /// Deletes `key`. A missing key is a no-op.
    pub fn delete(&self, key: &str) -> Result<()> {
        if !self.inner.state.read().keys.contains_key(key) {
            return Ok(());
        }
        let path = self.key_path(key);
        let _path_lock = self.inner.core.locks.lock(&path);
        let mut st = self.inner.state.write();
        if !st.keys.contains_key(key) {
            return Ok(());
        }
        let removed = fs::remove_file(&path);
        st.keys.remove(key);
        st.meta.remove_key(key);
        drop(st);
        self.inner.files.delete(&path);
        removed.map_err(Into::into)
    }

    /// Fired by the expiry worker: deletes `key` if its deadline has truly
    /// passed and the value was not rewritten since the timer was set.
    pub(crate) fn delete_timed(&self, key: &str, put_mtime: SystemTime) {
        let mut st = self.inner.state.write();
        let Some(stat) = st.keys.get(key) else {
            return;
        };
        let Some(expires_at) = st.meta.expiry_date(key) else {
            return;
        };
        if expires_at == 0 || keys::unix_now() < expires_at {
            // The deadline was cleared or extended.
            return;
        }
        match stat.modified() {
            Ok(mtime) if mtime == put_mtime => {}
            // Rewritten since; the newer write scheduled its own timer.
            _ => return,
        }
        let path = self.key_path(key);
        let _ = fs::remove_file(&path);
        st.keys.remove(key);
        st.meta.remove_key(key);
        drop(st);
        self.inner.files.delete(&path);
        debug!("timed key expired: {key}");
    }

    /// The cached stat for `key`.
    pub fn stat(&self, key: &str) -> Result<fs::Metadata> {
        self.inner
            .state
            .read()
            .keys
            .get(key)
            .cloned()
            .ok_or(Error::DoesNotExist)
    }

    /// All keys, sorted ascending (or descending with `reverse`).
    pub fn keys(&self, reverse: bool) -> Vec<String> {
        let st = self.inner.state.read();
        if reverse {
            st.keys.keys().rev().cloned().collect()
        } else {
            st.keys.keys().cloned().collect()
        }
    }

    /// All direct child bucket names, sorted ascending (or descending with
    /// `reverse`).
    pub fn buckets(&self, reverse: bool) -> Vec<String> {
        let st = self.inner.state.read();
        if reverse {
            st.children.keys().rev().cloned().collect()
        } else {
            st.children.keys().cloned().collect()
        }
    }

    /// Calls `f` for every key in ascending order with a reader over its
    /// value.
    ///
    /// The bucket's read lock is held for the whole iteration. Keys whose
    /// file has vanished are skipped; an error from `f` aborts the
    /// iteration and is surfaced.
    pub fn for_each<F>(&self, middlewares: &[Arc<dyn Middleware>], f: F) -> Result<()>
    where
        F: FnMut(&str, &mut dyn Read) -> Result<()>,
    {
        self.for_each_inner(false, middlewares, f)
    }

    /// [`for_each`](Bucket::for_each) in descending key order.
    pub fn for_each_reverse<F>(&self, middlewares: &[Arc<dyn Middleware>], f: F) -> Result<()>
    where
        F: FnMut(&str, &mut dyn Read) -> Result<()>,
    {
        self.for_each_inner(true, middlewares, f)
    }

    fn for_each_inner<F>(
        &self,
        reverse: bool,
        middlewares: &[Arc<dyn Middleware>],
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&str, &mut dyn Read) -> Result<()>,
    {
        let st = self.inner.state.read();
        let iter: Box<dyn Iterator<Item = &String>> = if reverse {
            Box::new(st.keys.keys().rev())
        } else {
            Box::new(st.keys.keys())
        };
        for key in iter {
            let path = self.key_path(key);
            let reader = match self.inner.files.get(&path) {
                Ok(reader) => reader,
                Err(err) => {
                    debug!("skipping {key} during iteration: {err}");
                    continue;
                }
            };
            let mut reader = chain::apply_readers(middlewares, &path, reader)?;
            f(key.as_str(), &mut *reader)?;
        }
        Ok(())
    }

    /// Sets one extra metadata tag on `file_key`; an empty value deletes
    /// the tag. Persisted immediately.
    pub fn set_extra_data(&self, file_key: &str, tag: &str, value: &str) -> Result<()> {
        let mut st = self.inner.state.write();
        if !st.keys.contains_key(file_key) {
            return Err(Error::DoesNotExist);
        }
        st.meta.set_extra_data(file_key, tag, value);
        st.meta.store()
    }

    /// One extra metadata tag for `file_key`.
    pub fn get_extra_data(&self, file_key: &str, tag: &str) -> Option<String> {
        self.inner.state.read().meta.extra_value(file_key, tag)
    }

    /// An independently owned copy of all extra metadata on `file_key`.
    pub fn extra_data(&self, file_key: &str) -> BTreeMap<String, String> {
        self.inner.state.read().meta.copy_extra(file_key)
    }

    /// Extra metadata for every key in the bucket. Keys without extra data
    /// map to an empty map.
    pub fn all_extra_data(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let st = self.inner.state.read();
        st.keys
            .keys()
            .map(|key| (key.clone(), st.meta.copy_extra(key)))
            .collect()
    }

    /// An independent copy of the bucket's monotonic ID counter.
    pub fn next_id(&self) -> BigUint {
        self.inner.state.read().meta.counter().clone()
    }

    /// Wraps this bucket in a view that applies `middlewares` by default.
    pub fn group(&self, middlewares: Vec<Arc<dyn Middleware>>) -> Group {
        Group::new(self.clone(), middlewares)
    }
}
