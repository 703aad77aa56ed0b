//! Middleware chain composition.
//!
//! For middlewares M1..Mn over a base file writer W0, the write chain is
//! Wn = Mn(... M1(W0)); writes go to Wn and closing finalises Wn, Wn-1,
//! ..., W0 in that order, collecting every error. Read chains compose
//! symmetrically over the open-file cache reader; dropping the top reader
//! unwinds the layers and releases the cache reference.

use crate::error::{Error, ErrorList, Result};
use crate::files;
use crate::mw::{FinishWrite, Middleware};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// The base of every write chain: the raw temp or value file.
struct FileSink(File);

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for FileSink {
    fn finish(mut self: Box<Self>) -> (io::Result<()>, Option<Box<dyn FinishWrite>>) {
        (self.0.flush(), None)
    }
}

/// A composed write pipeline. Write through it, then [`close`] it; errors
/// from every layer's finish are retained.
///
/// [`close`]: WriterChain::close
pub(crate) struct WriterChain {
    top: Option<Box<dyn FinishWrite>>,
}

impl std::fmt::Debug for WriterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterChain").finish_non_exhaustive()
    }
}

impl WriterChain {
    /// Builds the chain over `file`, applying `middlewares` in order. A
    /// failing factory unwinds the layers opened so far and surfaces the
    /// failure wrapped with the middleware's name.
    pub(crate) fn new(
        middlewares: &[Arc<dyn Middleware>],
        path: &Path,
        file: File,
    ) -> Result<Self> {
        let mut top: Box<dyn FinishWrite> = Box::new(FileSink(file));
        for mw in middlewares {
            top = mw.writer(path, top).map_err(|source| Error::Middleware {
                name: mw.name().to_string(),
                source,
            })?;
        }
        Ok(Self { top: Some(top) })
    }

    /// Finalises every layer from the outside in. The first error is the
    /// result; later errors are retained alongside it.
    pub(crate) fn close(mut self) -> Result<()> {
        let mut errors = ErrorList::new();
        let mut layer = self.top.take();
        while let Some(current) = layer {
            let (res, inner) = current.finish();
            if let Err(err) = res {
                errors.push(err.into());
            }
            layer = inner;
        }
        errors.into_result()
    }
}

impl Write for WriterChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.top.as_mut() {
            Some(top) => top.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "write chain closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.top.as_mut() {
            Some(top) => top.flush(),
            None => Ok(()),
        }
    }
}

/// Wraps a cache reader in `middlewares`, applied in order. Dropping the
/// result closes every layer and returns the cache reference.
pub(crate) fn apply_readers(
    middlewares: &[Arc<dyn Middleware>],
    path: &Path,
    reader: files::Reader,
) -> Result<Box<dyn Read + Send>> {
    let stat = reader.stat().clone();
    let mut top: Box<dyn Read + Send> = Box::new(reader);
    for mw in middlewares {
        top = mw
            .reader(path, top, &stat)
            .map_err(|source| Error::Middleware {
                name: mw.name().to_string(),
                source,
            })?;
    }
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mw;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records finish order so tests can observe the teardown sequence.
    struct Tracing {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    struct TracingWriter {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
        inner: Box<dyn FinishWrite>,
    }

    impl Write for TracingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl FinishWrite for TracingWriter {
        fn finish(self: Box<Self>) -> (io::Result<()>, Option<Box<dyn FinishWrite>>) {
            self.log.lock().unwrap().push(self.label);
            let res = if self.fail {
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            } else {
                Ok(())
            };
            (res, Some(self.inner))
        }
    }

    impl Middleware for Tracing {
        fn name(&self) -> &str {
            self.label
        }

        fn writer(
            &self,
            _path: &Path,
            sink: Box<dyn FinishWrite>,
        ) -> io::Result<Box<dyn FinishWrite>> {
            Ok(Box::new(TracingWriter {
                label: self.label,
                log: Arc::clone(&self.log),
                fail: self.fail,
                inner: sink,
            }))
        }

        fn reader(
            &self,
            _path: &Path,
            source: Box<dyn Read + Send>,
            _stat: &fs::Metadata,
        ) -> io::Result<Box<dyn Read + Send>> {
            Ok(source)
        }
    }

    /// A middleware whose factories always fail.
    struct Broken;

    impl Middleware for Broken {
        fn name(&self) -> &str {
            "Broken"
        }

        fn writer(
            &self,
            _path: &Path,
            _sink: Box<dyn FinishWrite>,
        ) -> io::Result<Box<dyn FinishWrite>> {
            Err(io::Error::new(io::ErrorKind::Other, "cannot build"))
        }

        fn reader(
            &self,
            _path: &Path,
            _source: Box<dyn Read + Send>,
            _stat: &fs::Metadata,
        ) -> io::Result<Box<dyn Read + Send>> {
            Err(io::Error::new(io::ErrorKind::Other, "cannot build"))
        }
    }

    #[test]
    fn close_runs_outside_in() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mws: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tracing {
                label: "first",
                log: Arc::clone(&log),
                fail: false,
            }),
            Arc::new(Tracing {
                label: "second",
                log: Arc::clone(&log),
                fail: false,
            }),
        ];
        let file = File::create(&path).unwrap();
        let mut chain = WriterChain::new(&mws, &path, file).unwrap();
        chain.write_all(b"x").unwrap();
        chain.close().unwrap();
        // The outermost layer (applied last) finishes first.
        assert_eq!(&*log.lock().unwrap(), &["second", "first"]);
    }

    #[test]
    fn close_keeps_every_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mws: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tracing {
                label: "inner",
                log: Arc::clone(&log),
                fail: true,
            }),
            Arc::new(Tracing {
                label: "outer",
                log: Arc::clone(&log),
                fail: true,
            }),
        ];
        let file = File::create(&path).unwrap();
        let chain = WriterChain::new(&mws, &path, file).unwrap();
        match chain.close() {
            Err(Error::Multi(list)) => assert_eq!(list.errors().len(), 2),
            other => panic!("expected Multi, got {other:?}"),
        }
        assert_eq!(
            &*log.lock().unwrap(),
            &["outer", "inner"],
            "a failing layer does not stop the teardown"
        );
    }

    #[test]
    fn factory_failure_carries_the_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let mws: Vec<Arc<dyn Middleware>> = vec![Arc::new(Broken)];
        let file = File::create(&path).unwrap();
        match WriterChain::new(&mws, &path, file) {
            Err(Error::Middleware { name, .. }) => assert_eq!(name, "Broken"),
            other => panic!("expected Middleware error, got {other:?}"),
        }
    }

    #[test]
    fn stacked_compressors_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let mws: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(mw::Flate::new(9)),
            Arc::new(mw::Gzip::new(9)),
            Arc::new(mw::Base64::new()),
        ];

        let file = File::create(&path).unwrap();
        let mut chain = WriterChain::new(&mws, &path, file).unwrap();
        chain.write_all(&payload).unwrap();
        chain.close().unwrap();

        let files = crate::files::Files::new(crate::db::Semaphore::new(4));
        let reader = files.get(&path).unwrap();
        let mut top = apply_readers(&mws, &path, reader).unwrap();
        let mut out = Vec::new();
        top.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn snappy_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let payload = b"snappy snappy snappy".repeat(100);
        let mws: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw::Snappy::new())];

        let file = File::create(&path).unwrap();
        let mut chain = WriterChain::new(&mws, &path, file).unwrap();
        chain.write_all(&payload).unwrap();
        chain.close().unwrap();

        let files = crate::files::Files::new(crate::db::Semaphore::new(4));
        let reader = files.get(&path).unwrap();
        let mut top = apply_readers(&mws, &path, reader).unwrap();
        let mut out = Vec::new();
        top.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }
}
