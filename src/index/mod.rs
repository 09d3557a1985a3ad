//! Local index of images, and their references.
//!
//! Images are identified by the digest of their configuration blob, and
//! they are reference-counted. Every tag association and every digest
//! association is a reference. Each manifest of an image has its own
//! record, so a reference always resolves to the blobs of its manifest.
//! When the last reference to an image is removed, its records are
//! deleted, and their blobs are released to be collected from the blob
//! store.
//!
//! The index is stored in `index.json`. Each commit writes a new copy of
//! the file, and renames it over the previous one. A commit is visible to
//! readers only after the file is written.

mod locks;
mod state;

use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::{
    digest::Digest,
    error::{try_io, Error},
    manifests::Manifest,
    reference::{Reference, Repository},
    store::{sync_directory, BlobStore},
};

use locks::KeyLocks;
use state::State;

const INDEX_FILE: &str = "index.json";

/// Content ID of an image: the digest of its configuration.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct ImageId(pub Digest);

impl ImageId {
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Local metadata of an image manifest.
///
/// Manifests with the same configuration (like the same image with layers
/// in different compression formats) have the same [`ImageId`].
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ImageRecord {
    pub id: ImageId,

    /// Digest of the image manifest.
    pub manifest: Digest,

    pub config: Digest,

    pub layers: Vec<Digest>,
}

impl ImageRecord {
    pub fn new(manifest_digest: Digest, manifest: &Manifest) -> Self {
        ImageRecord {
            id: ImageId(manifest.config.digest.clone()),
            manifest: manifest_digest,
            config: manifest.config.digest.clone(),
            layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
        }
    }

    /// Manifest, configuration, and layers.
    pub fn blobs(&self) -> impl Iterator<Item = &Digest> {
        [&self.manifest, &self.config]
            .into_iter()
            .chain(&self.layers)
    }
}

/// Row returned by [`Index::list`].
#[derive(Clone, Debug, PartialEq)]
pub struct ListEntry {
    /// `None` for digest associations with no tag.
    pub tag: Option<String>,

    pub digest: Digest,

    pub image: ImageId,
}

/// Result of [`Index::resolve`].
#[derive(Clone, Debug)]
pub struct Resolved {
    /// Digest of the manifest (or image index) of the reference.
    pub digest: Digest,

    pub record: ImageRecord,
}

/// Changes made by a commit that removes references.
#[derive(Debug, Default)]
pub struct Removal {
    /// References removed from the index.
    pub untagged: Vec<Reference>,

    /// Images deleted because they have no references.
    pub deleted: Vec<ImageId>,

    /// Blobs released by the deleted images.
    pub blobs: Vec<Digest>,
}

impl Removal {
    pub fn is_empty(&self) -> bool {
        self.untagged.is_empty() && self.deleted.is_empty() && self.blobs.is_empty()
    }
}

/// Reference index of the local image store.
pub struct Index {
    path: PathBuf,

    state: Mutex<State>,

    /// Signaled when a collection is finished.
    collected: Condvar,

    /// Held from the mutation of a commit until the new state is
    /// installed. The value is the generation of the last snapshot
    /// written to disk.
    writer: Mutex<u64>,

    keys: KeyLocks,
}

/// Blobs protected from garbage collection.
///
/// The protection is removed when this instance is dropped. Blobs released
/// by a deleted image while they were leased are removed from the store
/// at that point, unless another image uses them.
pub struct Lease<'a> {
    index: &'a Index,
    store: &'a BlobStore,
    digests: Vec<Digest>,
}

impl Index {
    /// Load the index from `root`. It is empty if there is no index file.
    pub fn open(root: &Path) -> Result<Index, Error> {
        let path = root.join(INDEX_FILE);

        let mut state: State = match File::open(&path) {
            Ok(mut file) => {
                let mut data = Vec::new();
                try_io!(&path, file.read_to_end(&mut data));
                serde_json::from_slice(&data)?
            }

            Err(e) if e.kind() == io::ErrorKind::NotFound => State::default(),

            Err(e) => return Err(Error::Io(e, path)),
        };

        state.rebuild_refcounts();

        Ok(Index {
            path,
            state: Mutex::new(state),
            collected: Condvar::new(),
            writer: Mutex::new(0),
            keys: KeyLocks::default(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, u64> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `mutation` to a copy of the state, write it to disk, and
    /// replace the current state with it.
    ///
    /// Nothing is changed if either the mutation or the write fails. The
    /// `keys` are locked until the new state is installed.
    fn commit<T>(
        &self,
        keys: Vec<String>,
        mutation: impl FnOnce(&mut State, &mut Removal) -> Result<T, Error>,
    ) -> Result<(T, Removal), Error> {
        let _guard = self.keys.lock(keys);
        let mut writer = self.writer();

        let (value, mut next, removal, snapshot) = {
            let mut state = self.state();

            let mut next = state.clone();
            let mut removal = Removal::default();
            let value = mutation(&mut next, &mut removal)?;
            let snapshot = serde_json::to_vec_pretty(&next)?;

            state.reserve(&next);

            (value, next, removal, snapshot)
        };

        let generation = *writer + 1;
        if let Err(e) = self.persist(&snapshot) {
            // Released blobs stay in the store.
            self.finish_collection(&removal.blobs);
            return Err(e);
        }

        *writer = generation;
        log::debug!("index generation {generation} written");

        let mut state = self.state();
        next.adopt_runtime(&mut state);
        *state = next;

        Ok((value, removal))
    }

    /// Write a snapshot of the state.
    fn persist(&self, snapshot: &[u8]) -> Result<(), Error> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut temp_file = try_io!(
            dir,
            tempfile::Builder::new()
                .prefix(".index.json")
                .tempfile_in(dir)
        );

        try_io!(&self.path, temp_file.write_all(snapshot));
        try_io!(&self.path, temp_file.as_file().sync_all());
        try_io!(&self.path, temp_file.persist(&self.path).map_err(|e| e.error));
        try_io!(dir, sync_directory(dir));

        Ok(())
    }

    /// Point `repository:tag` to `digest`. The digest must be already in
    /// the index.
    pub fn set_tag(
        &self,
        repository: &Repository,
        tag: &str,
        digest: &Digest,
    ) -> Result<Removal, Error> {
        let keys = vec![tag_key(repository, tag)];
        self.commit(keys, |state, removal| {
            state.set_tag(repository, tag, digest, removal)
        })
        .map(|(_, r)| r)
    }

    /// Register an image record, and associate `repository@digest` to it.
    /// Nothing is changed if the association already exists.
    pub fn add_digest(
        &self,
        repository: &Repository,
        digest: &Digest,
        record: ImageRecord,
    ) -> Result<Removal, Error> {
        let keys = vec![digest_key(repository, digest), image_key(&record.id)];
        self.commit(keys, |state, _| {
            state.register(digest, record)?;
            state.add_digest(repository, digest)
        })
        .map(|(_, r)| r)
    }

    /// Point `repository:tag` to the image of `source`.
    ///
    /// The source is resolved in the same commit, so it fails with
    /// [`Error::NotFound`] if the image was deleted. Returns the digest of
    /// the tag.
    pub fn tag(
        &self,
        source: &Reference,
        repository: &Repository,
        tag: &str,
    ) -> Result<(Digest, Removal), Error> {
        let keys = vec![tag_key(repository, tag)];
        self.commit(keys, |state, removal| {
            let (digest, _) = state.resolve(source)?;
            state.set_tag(repository, tag, &digest, removal)?;
            Ok(digest)
        })
    }

    /// Register an image record, and point `repository:tag` to it, in a
    /// single commit.
    ///
    /// The blobs of the record must be leased by the caller.
    pub fn commit_tag(
        &self,
        repository: &Repository,
        tag: &str,
        digest: &Digest,
        record: ImageRecord,
    ) -> Result<Removal, Error> {
        let keys = vec![tag_key(repository, tag), image_key(&record.id)];
        self.commit(keys, |state, removal| {
            state.register(digest, record)?;
            state.set_tag(repository, tag, digest, removal)
        })
        .map(|(_, r)| r)
    }

    /// Register an image record, and add both `repository@digest` and
    /// `repository:tag`, in a single commit.
    pub fn commit_tag_and_digest(
        &self,
        repository: &Repository,
        tag: &str,
        digest: &Digest,
        record: ImageRecord,
    ) -> Result<Removal, Error> {
        let keys = vec![
            tag_key(repository, tag),
            digest_key(repository, digest),
            image_key(&record.id),
        ];

        self.commit(keys, |state, removal| {
            state.register(digest, record)?;
            state.add_digest(repository, digest)?;
            state.set_tag(repository, tag, digest, removal)
        })
        .map(|(_, r)| r)
    }

    pub fn remove_tag(&self, repository: &Repository, tag: &str) -> Result<Removal, Error> {
        let keys = vec![tag_key(repository, tag)];
        self.commit(keys, |state, removal| {
            state.remove_tag(repository, tag, removal)
        })
        .map(|(_, r)| r)
    }

    /// Remove `repository@digest`. It fails with [`Error::InUse`] if a tag
    /// in the repository points to the digest.
    pub fn remove_digest(&self, repository: &Repository, digest: &Digest) -> Result<Removal, Error> {
        let keys = vec![digest_key(repository, digest)];
        self.commit(keys, |state, removal| {
            state.remove_digest(repository, digest, removal)
        })
        .map(|(_, r)| r)
    }

    /// Delete a reference.
    ///
    /// When the last tag of a repository for an image is removed, the
    /// digest associations of the repository to that image are removed
    /// too. A digest can't be removed while a tag in the repository points
    /// to it, unless `force` is set; in that case, the tags are removed
    /// with the digest.
    pub fn delete(&self, reference: &Reference, force: bool) -> Result<Removal, Error> {
        let mut keys = Vec::new();
        if let Some(tag) = &reference.tag {
            keys.push(tag_key(&reference.repository, tag));
        }

        if let Some(digest) = &reference.digest {
            keys.push(digest_key(&reference.repository, digest));
        }

        self.commit(keys, |state, removal| {
            state.delete_reference(reference, force, removal)
        })
        .map(|(_, r)| r)
    }

    /// Delete an image record. It fails with [`Error::InUse`] if there is
    /// any reference to it, unless `force` is set.
    pub fn delete_image(&self, id: &ImageId, force: bool) -> Result<Removal, Error> {
        let keys = vec![image_key(id)];
        self.commit(keys, |state, removal| state.delete_image(id, force, removal))
            .map(|(_, r)| r)
    }

    /// Find the image of a reference.
    pub fn resolve(&self, reference: &Reference) -> Result<Resolved, Error> {
        let state = self.state();
        let (digest, record) = state.resolve(reference)?;

        Ok(Resolved {
            digest,
            record: record.clone(),
        })
    }

    /// Tags and digests of a repository. Tags come first, sorted by name,
    /// followed by the digests with no tag.
    pub fn list(&self, repository: &Repository) -> Vec<ListEntry> {
        self.state().list(repository)
    }

    /// Repositories with at least one reference.
    pub fn repositories(&self) -> Vec<Repository> {
        self.state()
            .repositories()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn image(&self, id: &ImageId) -> Option<ImageRecord> {
        self.state().image(id).cloned()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.state().images().cloned().collect()
    }

    /// References (tags and digests) to an image.
    pub fn references(&self, id: &ImageId) -> Vec<Reference> {
        self.state().references(id)
    }

    /// Number of references to an image.
    pub fn refcount(&self, id: &ImageId) -> usize {
        self.state().refcount(id)
    }

    /// Protect blobs from garbage collection.
    ///
    /// If any of the blobs is being removed, it waits until the removal
    /// is finished. Then, the caller has to check whether the blob exists.
    pub fn lease<'a>(
        &'a self,
        store: &'a BlobStore,
        digests: impl IntoIterator<Item = Digest>,
    ) -> Lease<'a> {
        let digests: Vec<_> = digests.into_iter().collect();

        let mut state = self.state();
        while digests.iter().any(|d| state.collecting.contains(d)) {
            state = self
                .collected
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        for digest in &digests {
            *state.leases.entry(digest.clone()).or_default() += 1;
        }

        Lease {
            index: self,
            store,
            digests,
        }
    }

    /// Remove the blobs released by a commit from the blob store.
    ///
    /// Failures are logged, and the blob is left in the store.
    pub fn collect(&self, store: &BlobStore, removal: &Removal) {
        self.remove_blobs(store, &removal.blobs);
    }

    fn remove_blobs(&self, store: &BlobStore, blobs: &[Digest]) {
        for blob in blobs {
            if let Err(e) = store.remove(blob) {
                log::warn!("can't collect blob {blob}: {e}");
            }
        }

        self.finish_collection(blobs);
    }

    fn finish_collection(&self, blobs: &[Digest]) {
        if blobs.is_empty() {
            return;
        }

        let mut state = self.state();
        for blob in blobs {
            state.collecting.remove(blob);
        }

        self.collected.notify_all();
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        // Deferred blobs are only updated by the writer.
        let released = {
            let _writer = self.index.writer();
            self.index.state().release_lease(&self.digests)
        };

        if !released.is_empty() {
            log::debug!("collect {} blobs released by a lease", released.len());
            self.index.remove_blobs(self.store, &released);
        }
    }
}

fn tag_key(repository: &Repository, tag: &str) -> String {
    format!("{repository}:{tag}")
}

fn digest_key(repository: &Repository, digest: &Digest) -> String {
    format!("{repository}@{digest}")
}

fn image_key(id: &ImageId) -> String {
    format!("image:{id}")
}
