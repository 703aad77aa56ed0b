//! Error and Result types for burrow operations.

use std::fmt;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for burrow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for database, bucket, and middleware operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested key or bucket does not exist.
    #[error("file does not exist")]
    DoesNotExist,

    /// The destination key exists and overwriting was not requested.
    #[error("key already exists")]
    KeyExists,

    /// A bucket path component exists on disk but is not a directory.
    #[error("invalid bucket type")]
    InvalidBucketType,

    /// The database is shutting down; no new operations are accepted.
    #[error("database is shutting down")]
    Closing,

    /// No more readers can be handed out for an open file.
    #[error("no readers available")]
    NoReaders,

    /// Source and destination resolve to the same on-disk path.
    #[error("same path")]
    SamePath,

    /// An unknown compressor extension was requested.
    #[error("invalid compressor")]
    InvalidCompressor,

    /// A raw (uncompressed) extension was requested from the compressor table.
    #[error("raw compressor provided")]
    RawCompressor,

    /// A middleware writer or reader factory failed.
    #[error("{name}: {source}")]
    Middleware {
        /// Display name of the failing middleware.
        name: String,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// Bucket metadata could not be encoded or decoded.
    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Multiple errors collected from a chained close.
    #[error("{0}")]
    Multi(ErrorList),
}

/// An ordered collection of errors gathered from a multi-step teardown.
///
/// Closing a middleware chain finalises every layer even when an earlier
/// layer failed; all failures are retained here. The first entry is the
/// primary result.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<Error>);

impl ErrorList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error to the list.
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    /// Appends the error of `res`, if any.
    pub fn push_if<T>(&mut self, res: Result<T>) {
        if let Err(err) = res {
            self.0.push(err);
        }
    }

    /// Returns `true` if no errors were collected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the collected errors.
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Collapses the list: `Ok` when empty, the sole error when singular,
    /// otherwise [`Error::Multi`] retaining every entry.
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn single_error_is_returned_directly() {
        let mut list = ErrorList::new();
        list.push(Error::DoesNotExist);
        assert!(matches!(list.into_result(), Err(Error::DoesNotExist)));
    }

    #[test]
    fn multiple_errors_are_retained() {
        let mut list = ErrorList::new();
        list.push(Error::DoesNotExist);
        list.push(Error::KeyExists);
        match list.into_result() {
            Err(Error::Multi(inner)) => {
                assert_eq!(inner.errors().len(), 2);
                assert_eq!(
                    inner.to_string(),
                    "file does not exist; key already exists"
                );
            }
            other => panic!("expected Multi, got {other:?}"),
        }
    }

    #[test]
    fn push_if_ignores_ok() {
        let mut list = ErrorList::new();
        list.push_if(Ok(()));
        assert!(list.is_empty());
        list.push_if::<()>(Err(Error::SamePath));
        assert!(!list.is_empty());
    }
}
