use std::{
    fs::File,
    io::{self, BufWriter, Write},
};

use tempfile::NamedTempFile;

use crate::digest::{Digest, Hasher};

/// Staged write to the blob store.
///
/// Data written to this instance is hashed and stored in a temporary file
/// in the staging directory. It is visible to readers only after
/// [`BlobStore::commit`](super::BlobStore::commit) verifies its digest.
///
/// If the writer is dropped before the commit, the temporary file is
/// deleted.
pub struct BlobWriter {
    expected: Digest,
    output: BufWriter<NamedTempFile>,
    hasher: Hasher,
    written: u64,
}

impl BlobWriter {
    pub(super) fn new(expected: Digest, temp_file: NamedTempFile) -> Self {
        BlobWriter {
            hasher: Hasher::new(expected.algorithm()),
            expected,
            output: BufWriter::new(temp_file),
            written: 0,
        }
    }

    /// Digest expected for the staged data.
    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush buffered data, and return the digest of everything written.
    pub(super) fn finalize(mut self) -> io::Result<(Digest, NamedTempFile)> {
        self.output.flush()?;
        let temp_file = self.output.into_inner().map_err(|e| e.into_error())?;

        let file: &File = temp_file.as_file();
        file.sync_all()?;

        Ok((self.hasher.finish(), temp_file))
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.output.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}
