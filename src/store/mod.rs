//! Content-addressable blob store.
//!
//! Blobs are stored in `blobs/<algorithm>/<hash>`. New blobs are written
//! to a temporary file in `staging/`, and they are renamed to their final
//! location only when the digest of the written data is the expected one.

mod writer;

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use rustix::fs::{Mode, OFlags};

use crate::{
    digest::{Digest, DigestError},
    error::{try_io, Error},
};

pub use writer::BlobWriter;

const BLOBS_DIR: &str = "blobs";

const STAGING_DIR: &str = "staging";

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the blob store in `root`. The directory is created if it does
    /// not exist.
    ///
    /// Files left in the staging directory by a previous process are
    /// removed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let store = BlobStore { root };

        let staging = store.root.join(STAGING_DIR);
        try_io!(&staging, fs::create_dir_all(&staging));
        try_io!(&store.root, fs::create_dir_all(store.root.join(BLOBS_DIR)));

        store.sweep_staging()?;

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(digest.algorithm().as_str())
            .join(digest.hash_value())
    }

    /// Open a scoped write target for a blob with the `expected` digest.
    pub fn stage(&self, expected: &Digest) -> Result<BlobWriter, Error> {
        let staging = self.root.join(STAGING_DIR);
        let temp_file = try_io!(
            &staging,
            tempfile::Builder::new()
                .prefix(expected.hash_value())
                .tempfile_in(&staging)
        );

        Ok(BlobWriter::new(expected.clone(), temp_file))
    }

    /// Verify the data in `writer`, and move it to its final location.
    ///
    /// If the digest of the data is not the expected one, the staged file
    /// is discarded, and the store is not modified.
    pub fn commit(&self, writer: BlobWriter) -> Result<Digest, Error> {
        let expected = writer.expected().clone();
        let (actual, temp_file) = try_io!(temp_path(&expected), writer.finalize());

        if actual != expected {
            log::warn!("discard staged blob for {expected}: got {actual}");
            return Err(Error::DigestMismatch { expected, actual });
        }

        let path = self.blob_path(&expected);
        let parent = path.parent().unwrap_or(&self.root);
        try_io!(parent, fs::create_dir_all(parent));

        // If the blob already exists, the rename replaces it with
        // identical content.
        try_io!(&path, temp_file.persist(&path).map_err(|e| e.error));
        try_io!(parent, sync_directory(parent));

        log::debug!("blob committed: {expected}");

        Ok(expected)
    }

    /// Store `data` as a blob, if it matches the `expected` digest.
    pub fn put(&self, data: &[u8], expected: &Digest) -> Result<Digest, Error> {
        let mut writer = self.stage(expected)?;
        try_io!(temp_path(expected), writer.write_all(data));
        self.commit(writer)
    }

    /// Open a blob for reading.
    pub fn read(&self, digest: &Digest) -> Result<File, Error> {
        let path = self.blob_path(digest);
        match File::open(&path) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {digest}")))
            }
            Err(e) => Err(Error::Io(e, path)),
        }
    }

    /// Read the full content of a blob into memory.
    pub fn read_to_vec(&self, digest: &Digest) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        try_io!(self.blob_path(digest), self.read(digest)?.read_to_end(&mut data));
        Ok(data)
    }

    /// Check whether a blob exists.
    ///
    /// Returns true if and only if the blob exists as a regular file. Any
    /// errors will cause this to return false.
    pub fn exists(&self, digest: &Digest) -> bool {
        fs::metadata(self.blob_path(digest))
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Size, in bytes, of a stored blob.
    pub fn size(&self, digest: &Digest) -> Result<u64, Error> {
        let file = self.read(digest)?;
        Ok(try_io!(self.blob_path(digest), file.metadata()).len())
    }

    /// Compute the digest of a stored blob, and compare it with its key.
    pub fn verify(&self, digest: &Digest) -> Result<(), Error> {
        let file = self.read(digest)?;
        let mut reader = digest.wrap_reader(io::BufReader::new(file));

        match io::copy(&mut reader, &mut io::sink()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                match e.into_inner().map(|e| e.downcast::<DigestError>()) {
                    Some(Ok(e)) => Err(Error::from(*e)),
                    _ => Err(Error::Io(
                        io::ErrorKind::InvalidData.into(),
                        self.blob_path(digest),
                    )),
                }
            }
            Err(e) => Err(Error::Io(e, self.blob_path(digest))),
        }
    }

    /// Delete a blob. It is not an error if the blob does not exist.
    pub(crate) fn remove(&self, digest: &Digest) -> Result<(), Error> {
        let path = self.blob_path(digest);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::Io(e, path)),
            _ => {
                log::debug!("blob removed: {digest}");
                Ok(())
            }
        }
    }

    /// Remove files left in the staging directory.
    fn sweep_staging(&self) -> Result<(), Error> {
        let staging = self.root.join(STAGING_DIR);
        for entry in try_io!(&staging, fs::read_dir(&staging)) {
            let path = try_io!(&staging, entry).path();
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("can't remove staged file {path:?}: {e}");
            }
        }

        Ok(())
    }
}

fn temp_path(digest: &Digest) -> PathBuf {
    Path::new(STAGING_DIR).join(digest.hash_value())
}

/// Flush the metadata of a directory, so a rename in it survives a crash.
pub(crate) fn sync_directory(path: &Path) -> io::Result<()> {
    let fd = rustix::fs::open(
        path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )?;

    rustix::fs::fsync(&fd)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io::Write, str::FromStr};

    use super::*;
    use crate::digest::fixtures;

    fn abc() -> Digest {
        Digest::from_str(fixtures::ABC).unwrap()
    }

    #[test]
    fn commit_verified_blob() {
        let root = tempfile::tempdir().unwrap();
        let store = BlobStore::open(root.path()).unwrap();

        assert!(!store.exists(&abc()));

        let mut writer = store.stage(&abc()).unwrap();
        writer.write_all(b"ab").unwrap();
        writer.write_all(b"c").unwrap();
        assert_eq!(writer.written(), 3);

        assert_eq!(store.commit(writer).unwrap(), abc());
        assert!(store.exists(&abc()));
        assert_eq!(store.read_to_vec(&abc()).unwrap(), b"abc");
        assert_eq!(store.size(&abc()).unwrap(), 3);
        store.verify(&abc()).unwrap();

        // Staging directory is empty after the commit.
        let staging = root.path().join(STAGING_DIR);
        assert!(fs::read_dir(staging).unwrap().next().is_none());
    }

    #[test]
    fn discard_mismatched_blob() {
        let root = tempfile::tempdir().unwrap();
        let store = BlobStore::open(root.path()).unwrap();

        match store.put(b"abcx", &abc()) {
            Err(Error::DigestMismatch { expected, actual }) => {
                assert_eq!(expected, abc());
                assert_eq!(actual.source(), fixtures::ABCX);
            }

            other => panic!("Unexpected result: {other:?}"),
        }

        assert!(!store.exists(&abc()));
        assert!(matches!(store.read(&abc()), Err(Error::NotFound(_))));

        // A failed commit does not affect an existing blob.
        store.put(b"abc", &abc()).unwrap();
        assert!(store.put(b"abcx", &abc()).is_err());
        assert_eq!(store.read_to_vec(&abc()).unwrap(), b"abc");
    }

    #[test]
    fn concurrent_commits_of_the_same_blob() {
        let root = tempfile::tempdir().unwrap();
        let store = BlobStore::open(root.path()).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| store.put(b"abc", &abc()).unwrap());
            }
        });

        assert_eq!(store.read_to_vec(&abc()).unwrap(), b"abc");
    }

    #[test]
    fn detect_corrupted_blob() {
        let root = tempfile::tempdir().unwrap();
        let store = BlobStore::open(root.path()).unwrap();

        store.put(b"abc", &abc()).unwrap();
        fs::write(store.blob_path(&abc()), b"abx").unwrap();

        assert!(matches!(
            store.verify(&abc()),
            Err(Error::DigestMismatch { .. })
        ));
    }

    #[test]
    fn sweep_staged_files_on_open() {
        let root = tempfile::tempdir().unwrap();
        let store = BlobStore::open(root.path()).unwrap();

        let mut writer = store.stage(&abc()).unwrap();
        writer.write_all(b"abc").unwrap();
        std::mem::forget(writer);

        let staging = root.path().join(STAGING_DIR);
        assert!(fs::read_dir(&staging).unwrap().next().is_some());

        BlobStore::open(root.path()).unwrap();
        assert!(fs::read_dir(&staging).unwrap().next().is_none());
    }

    #[test]
    fn remove_blob() {
        let root = tempfile::tempdir().unwrap();
        let store = BlobStore::open(root.path()).unwrap();

        store.put(b"abc", &abc()).unwrap();
        store.remove(&abc()).unwrap();
        assert!(!store.exists(&abc()));

        // Missing blobs are ignored.
        store.remove(&abc()).unwrap();
    }
}
