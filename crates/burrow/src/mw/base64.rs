//! Base64 middleware over the standard URL-safe alphabet.

use super::{FinishWrite, Middleware};
use base64::engine::general_purpose::URL_SAFE;
use base64::engine::GeneralPurpose;
use base64::read::DecoderReader;
use base64::write::EncoderWriter;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// Encodes values as URL-safe base64 on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64;

impl Base64 {
    /// Creates the middleware.
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for Base64 {
    fn name(&self) -> &str {
        "Base64 Middleware"
    }

    fn writer(&self, _path: &Path, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(Base64Writer(EncoderWriter::new(sink, &URL_SAFE))))
    }

    fn reader(
        &self,
        _path: &Path,
        source: Box<dyn Read + Send>,
        _stat: &fs::Metadata,
    ) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(DecoderReader::new(source, &URL_SAFE)))
    }
}

struct Base64Writer(EncoderWriter<'static, GeneralPurpose, Box<dyn FinishWrite>>);

impl Write for Base64Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for Base64Writer {
    fn finish(mut self: Box<Self>) -> (io::Result<()>, Option<Box<dyn FinishWrite>>) {
        match self.0.finish() {
            Ok(inner) => (Ok(()), Some(inner)),
            Err(err) => (Err(err), None),
        }
    }
}
