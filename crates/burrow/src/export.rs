//! Bulk export to a streaming tape archive.
//!
//! Traversal is depth-first: a bucket's keys in ascending order, then each
//! child bucket. Entry names are relative to the database root so an
//! importer can unpack anywhere. Values are copied raw, exactly as stored
//! on disk; a caller that exported through middleware reads them back the
//! same way.

use crate::bucket::Bucket;
use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tracing::warn;

impl Bucket {
    /// Serialises this bucket's subtree into a new tape archive written to
    /// `w`, finishing the archive before returning.
    pub fn export<W: Write>(&self, w: W) -> Result<()> {
        let mut builder = tar::Builder::new(w);
        self.export_into(&mut builder)?;
        builder.into_inner()?;
        Ok(())
    }

    /// Serialises this bucket's subtree into an existing tape writer.
    /// Closure of the archive is left to the caller.
    pub fn export_into<W: Write>(&self, builder: &mut tar::Builder<W>) -> Result<()> {
        export_bucket(self, builder, &self.inner.core.root_path)
    }
}

fn export_bucket<W: Write>(
    bucket: &Bucket,
    builder: &mut tar::Builder<W>,
    root: &Path,
) -> Result<()> {
    let st = bucket.inner.state.read();
    for (key, stat) in st.keys.iter() {
        let path = bucket.key_path(key);
        let name = path.strip_prefix(root).unwrap_or(&path);
        // Open before writing the header so a vanished file skips cleanly.
        let reader = match bucket.inner.files.get(&path) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("export: skipping {key} ({name:?}): {err}");
                continue;
            }
        };
        let mut header = tar::Header::new_ustar();
        header.set_metadata(stat);
        builder.append_data(&mut header, name, reader)?;
    }
    for child in st.children.values() {
        export_bucket(child, builder, root)?;
    }
    Ok(())
}
