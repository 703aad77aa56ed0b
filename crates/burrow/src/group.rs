//! Bucket views with a default middleware list.
//!
//! A group forwards every operation to its bucket, injecting its default
//! middlewares whenever the caller passes an empty list. A non-empty
//! caller list replaces the defaults wholesale rather than stacking on
//! top of them, which is what lets a caller bypass compression for a
//! single read.

use crate::bucket::{Bucket, ValueReader};
use crate::error::Result;
use crate::mw::Middleware;
use num_bigint::BigUint;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A [`Bucket`] view that applies a default middleware list.
#[derive(Clone)]
pub struct Group {
    bucket: Bucket,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Group {
    pub(crate) fn new(bucket: Bucket, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            bucket,
            middlewares,
        }
    }

    fn pick<'a>(&'a self, explicit: &'a [Arc<dyn Middleware>]) -> &'a [Arc<dyn Middleware>] {
        if explicit.is_empty() {
            &self.middlewares
        } else {
            explicit
        }
    }

    /// The underlying bucket, stripped of the default middlewares.
    pub fn as_bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// The bucket's display name.
    pub fn name(&self) -> &str {
        self.bucket.name()
    }

    /// The bucket's directory on disk.
    pub fn path(&self) -> &Path {
        self.bucket.path()
    }

    /// Descends to a nested bucket, carrying this group's defaults.
    pub fn bucket(&self, names: &[&str]) -> Option<Group> {
        let bucket = self.bucket.bucket(names)?;
        Some(Group::new(bucket, self.middlewares.clone()))
    }

    /// Creates (or reuses) a nested bucket, carrying this group's defaults.
    pub fn create_bucket(&self, names: &[&str]) -> Result<Group> {
        let bucket = self.bucket.create_bucket(names)?;
        Ok(Group::new(bucket, self.middlewares.clone()))
    }

    /// Removes a direct child bucket and its directory tree.
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        self.bucket.delete_bucket(name)
    }

    /// See [`Bucket::get`].
    pub fn get(&self, key: &str, middlewares: &[Arc<dyn Middleware>]) -> Result<ValueReader> {
        self.bucket.get(key, self.pick(middlewares))
    }

    /// See [`Bucket::put`].
    pub fn put<R: Read>(
        &self,
        key: &str,
        reader: R,
        middlewares: &[Arc<dyn Middleware>],
    ) -> Result<()> {
        self.bucket.put(key, reader, self.pick(middlewares))
    }

    /// See [`Bucket::put_timed`].
    pub fn put_timed<R: Read>(
        &self,
        key: &str,
        reader: R,
        expire_after: Duration,
        middlewares: &[Arc<dyn Middleware>],
    ) -> Result<()> {
        self.bucket
            .put_timed(key, reader, expire_after, self.pick(middlewares))
    }

    /// See [`Bucket::put_func`].
    pub fn put_func<F>(&self, key: &str, middlewares: &[Arc<dyn Middleware>], f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        self.bucket.put_func(key, self.pick(middlewares), f)
    }

    /// See [`Bucket::put_timed_func`].
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
        self.bucket
            .put_timed_func(key, expire_after, self.pick(middlewares), f)
    }

    /// See [`Bucket::append`].
    pub fn append<R: Read>(
        &self,
        key: &str,
        reader: R,
        middlewares: &[Arc<dyn Middleware>],
    ) -> Result<()> {
        self.bucket.append(key, reader, self.pick(middlewares))
    }

    /// See [`Bucket::append_func`].
    pub fn append_func<F>(&self, key: &str, middlewares: &[Arc<dyn Middleware>], f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        self.bucket.append_func(key, self.pick(middlewares), f)
    }

    /// See [`Bucket::get_and_delete`].
    pub fn get_and_delete<F>(
        &self,
        key: &str,
        middlewares: &[Arc<dyn Middleware>],
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut dyn Read) -> Result<()>,
    {
        self.bucket.get_and_delete(key, self.pick(middlewares), f)
    }

    /// See [`Bucket::get_and_rename`].
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
        self.bucket
            .get_and_rename(key, dst, new_key, overwrite, self.pick(middlewares), f)
    }

    /// See [`Bucket::rename`].
    pub fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        self.bucket.rename(key, new_key)
    }

    /// See [`Bucket::delete`].
    pub fn delete(&self, key: &str) -> Result<()> {
        self.bucket.delete(key)
    }

    /// See [`Bucket::stat`].
    pub fn stat(&self, key: &str) -> Result<fs::Metadata> {
        self.bucket.stat(key)
    }

    /// See [`Bucket::keys`].
    pub fn keys(&self, reverse: bool) -> Vec<String> {
        self.bucket.keys(reverse)
    }

    /// See [`Bucket::buckets`].
    pub fn buckets(&self, reverse: bool) -> Vec<String> {
        self.bucket.buckets(reverse)
    }

    /// See [`Bucket::for_each`].
    pub fn for_each<F>(&self, middlewares: &[Arc<dyn Middleware>], f: F) -> Result<()>
    where
        F: FnMut(&str, &mut dyn Read) -> Result<()>,
    {
        self.bucket.for_each(self.pick(middlewares), f)
    }

    /// See [`Bucket::for_each_reverse`].
    pub fn for_each_reverse<F>(&self, middlewares: &[Arc<dyn Middleware>], f: F) -> Result<()>
    where
        F: FnMut(&str, &mut dyn Read) -> Result<()>,
    {
        self.bucket.for_each_reverse(self.pick(middlewares), f)
    }

    /// See [`Bucket::set_extra_data`].
    pub fn set_extra_data(&self, file_key: &str, tag: &str, value: &str) -> Result<()> {
        self.bucket.set_extra_data(file_key, tag, value)
    }

    /// See [`Bucket::get_extra_data`].
    pub fn get_extra_data(&self, file_key: &str, tag: &str) -> Option<String> {
        self.bucket.get_extra_data(file_key, tag)
    }

    /// See [`Bucket::extra_data`].
    pub fn extra_data(&self, file_key: &str) -> BTreeMap<String, String> {
        self.bucket.extra_data(file_key)
    }

    /// See [`Bucket::all_extra_data`].
    pub fn all_extra_data(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.bucket.all_extra_data()
    }

    /// See [`Bucket::next_id`].
    pub fn next_id(&self) -> BigUint {
        self.bucket.next_id()
    }

    /// Replaces (not appends to) the default middleware list.
    pub fn group(&self, middlewares: Vec<Arc<dyn Middleware>>) -> Group {
        Group::new(self.bucket.clone(), middlewares)
    }

    /// See [`Bucket::export`].
    pub fn export<W: Write>(&self, w: W) -> Result<()> {
        self.bucket.export(w)
    }
}
