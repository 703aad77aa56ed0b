//! Stackable encode/decode middleware.
//!
//! A middleware wraps the raw value stream on its way to and from disk:
//! compression, encoding, anything that can be expressed as a writer and a
//! reader factory. Layers compose in application order for writes and
//! reads; closing a composed chain finalises each layer from the outside
//! in, and a layer's finish must hand its inner stream back intact rather
//! than closing it.

use crate::error::{Error, Result};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

mod base64;
mod compress;

pub use self::base64::Base64;
pub use self::compress::{Flate, Gzip, Snappy};

/// One layer of a write chain.
///
/// `finish` finalises this layer's encoder and returns the wrapped sink so
/// the chain can keep closing toward the base file. It must *not* close the
/// inner writer.
pub trait FinishWrite: Write + Send {
    /// Finalises the layer, returning its result together with the inner
    /// writer (if any) for the next step of the teardown.
    fn finish(self: Box<Self>) -> (io::Result<()>, Option<Box<dyn FinishWrite>>);
}

/// A stackable encoder/decoder.
///
/// Factory errors are surfaced to callers wrapped with the middleware's
/// name. The streams a factory returns own their inner stream for the
/// duration of the operation but give it back (writers through
/// [`FinishWrite::finish`], readers by dropping) without closing it.
pub trait Middleware: Send + Sync {
    /// Display name, used for error wrapping.
    fn name(&self) -> &str;

    /// Wraps `sink` with this layer's encoder.
    fn writer(&self, path: &Path, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>>;

    /// Wraps `source` with this layer's decoder. `stat` describes the
    /// on-disk file backing the chain.
    fn reader(
        &self,
        path: &Path,
        source: Box<dyn Read + Send>,
        stat: &fs::Metadata,
    ) -> io::Result<Box<dyn Read + Send>>;
}

/// Returns the compressor middleware conventionally used for a file
/// extension.
///
/// `log`, `txt`, and `raw` name uncompressed data and yield
/// [`Error::RawCompressor`]; unknown extensions yield
/// [`Error::InvalidCompressor`].
pub fn by_extension(ext: &str) -> Result<Arc<dyn Middleware>> {
    match ext {
        "gz" | "gzip" => Ok(Arc::new(Gzip::new(6))),
        "snappy" => Ok(Arc::new(Snappy::new())),
        "log" | "txt" | "raw" => Err(Error::RawCompressor),
        _ => Err(Error::InvalidCompressor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_table() {
        assert_eq!(by_extension("gz").unwrap().name(), "Gzip Compressor");
        assert_eq!(by_extension("gzip").unwrap().name(), "Gzip Compressor");
        assert_eq!(by_extension("snappy").unwrap().name(), "Snappy Compressor");
        assert!(matches!(by_extension("txt"), Err(Error::RawCompressor)));
        assert!(matches!(by_extension("zip"), Err(Error::InvalidCompressor)));
    }
}
