//! Burrow - filesystem-backed blob key/value store
//!
//! This crate stores arbitrary byte streams as plain files and makes the
//! directory tree behave like a database: hierarchical buckets, streaming
//! reads and writes of any size, stackable encode/decode middleware,
//! time-based key expiry, atomic cross-bucket moves, per-key extra
//! metadata, a monotonic per-bucket ID counter, and bulk export to a tape
//! archive.
//!
//! # Components
//!
//! - [`Db`]: the database façade owning the root bucket and lifecycle
//! - [`Bucket`]: a directory exposing a key → blob mapping plus children
//! - [`Group`]: a bucket view that injects a default middleware list
//! - [`mw::Middleware`]: the stackable encoder/decoder interface
//!
//! # Concurrency
//!
//! Every value file is guarded by an interned per-path reader/writer lock,
//! so operations on distinct keys never contend. Concurrent readers of one
//! key share a single OS handle through positional reads. Writes stream
//! into a temp file and land with one atomic rename.
//!
//! # Example
//!
//! ```rust,ignore
//! use burrow::{Db, Options};
//!
//! let db = Db::open("/var/lib/myapp", Options::default())?;
//! let bucket = db.create_bucket(&["invoices", "2024"])?;
//!
//! bucket.put("invoice-17", &b"payload"[..], &[])?;
//!
//! let mut value = bucket.get("invoice-17", &[])?;
//! let mut buf = Vec::new();
//! value.read_to_end(&mut buf)?;
//!
//! db.close()?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod mw;

mod bucket;
mod chain;
mod db;
mod expiry;
mod export;
mod files;
mod group;
mod keys;
mod locks;
mod meta;

pub use bucket::{Bucket, ValueReader};
pub use db::{Db, Options, DEFAULT_MAX_OPEN_FILES};
pub use error::{Error, ErrorList, Result};
pub use group::Group;
pub use mw::{FinishWrite, Middleware};
