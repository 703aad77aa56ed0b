//! Compression middlewares: raw deflate, gzip, and framed snappy.

use super::{FinishWrite, Middleware};
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// Raw deflate compression at a fixed level (0-9).
#[derive(Debug, Clone, Copy)]
pub struct Flate {
    level: u32,
}

impl Flate {
    /// Creates the middleware with a compression level between 0 and 9.
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Middleware for Flate {
    fn name(&self) -> &str {
        "Flate Compressor"
    }

    fn writer(&self, _path: &Path, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(FlateWriter(DeflateEncoder::new(
            sink,
            Compression::new(self.level),
        ))))
    }

    fn reader(
        &self,
        _path: &Path,
        source: Box<dyn Read + Send>,
        _stat: &fs::Metadata,
    ) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(DeflateDecoder::new(source)))
    }
}

struct FlateWriter(DeflateEncoder<Box<dyn FinishWrite>>);

impl Write for FlateWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for FlateWriter {
    fn finish(self: Box<Self>) -> (io::Result<()>, Option<Box<dyn FinishWrite>>) {
        match self.0.finish() {
            Ok(inner) => (Ok(()), Some(inner)),
            Err(err) => (Err(err), None),
        }
    }
}

/// Gzip compression at a fixed level (0-9).
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: u32,
}

impl Gzip {
    /// Creates the middleware with a compression level between 0 and 9.
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Middleware for Gzip {
    fn name(&self) -> &str {
        "Gzip Compressor"
    }

    fn writer(&self, _path: &Path, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(GzipWriter(GzEncoder::new(
            sink,
            Compression::new(self.level),
        ))))
    }

    fn reader(
        &self,
        _path: &Path,
        source: Box<dyn Read + Send>,
        _stat: &fs::Metadata,
    ) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(GzDecoder::new(source)))
    }
}

struct GzipWriter(GzEncoder<Box<dyn FinishWrite>>);

impl Write for GzipWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for GzipWriter {
    fn finish(self: Box<Self>) -> (io::Result<()>, Option<Box<dyn FinishWrite>>) {
        match self.0.finish() {
            Ok(inner) => (Ok(()), Some(inner)),
            Err(err) => (Err(err), None),
        }
    }
}

/// Snappy frame-format compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snappy;

impl Snappy {
    /// Creates the middleware.
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for Snappy {
    fn name(&self) -> &str {
        "Snappy Compressor"
    }

    fn writer(&self, _path: &Path, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(SnappyWriter(snap::write::FrameEncoder::new(sink))))
    }

    fn reader(
        &self,
        _path: &Path,
        source: Box<dyn Read + Send>,
        _stat: &fs::Metadata,
    ) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(snap::read::FrameDecoder::new(source)))
    }
}

struct SnappyWriter(snap::write::FrameEncoder<Box<dyn FinishWrite>>);

impl Write for SnappyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for SnappyWriter {
    fn finish(mut self: Box<Self>) -> (io::Result<()>, Option<Box<dyn FinishWrite>>) {
        if let Err(err) = self.0.flush() {
            return (Err(err), None);
        }
        match self.0.into_inner() {
            Ok(inner) => (Ok(()), Some(inner)),
            Err(err) => {
                let err = io::Error::new(err.error().kind(), err.error().to_string());
                (Err(err), None)
            }
        }
    }
}
