//! Pull, push, tag, and delete images.

mod builder;
mod pull;
mod push;

use std::{path::PathBuf, sync::Arc};

use crate::{
    cancel::CancelToken,
    digest::Digest,
    error::Error,
    index::{ImageId, Index, ListEntry, Removal, Resolved},
    reference::{ParseError, Reference, Repository},
    registry::RegistryClient,
    store::BlobStore,
    EventHandler,
};

pub use builder::{default_store_dir, DistributorBuilder};

/// Result of a successful pull.
#[derive(Clone, Debug)]
pub struct Pulled {
    /// Canonical reference (`repository@digest`) to the pulled content.
    pub reference: Reference,

    /// Digest of the manifest, or image index, of the reference.
    pub digest: Digest,

    pub image: ImageId,

    /// `true` if the tag of the reference was updated.
    pub tagged: bool,
}

/// Image store, connected to remote registries.
///
/// Blobs are stored in a [`BlobStore`], and references in an [`Index`],
/// both in the same root directory.
pub struct Distributor {
    store: BlobStore,
    index: Index,
    client: RegistryClient,
    event_handler: Arc<dyn EventHandler>,
    architecture: String,
    os: String,
    parallel_downloads: usize,
}

impl Distributor {
    pub fn builder(root: impl Into<PathBuf>) -> DistributorBuilder {
        DistributorBuilder::new(root.into())
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Download an image, and add its reference to the index.
    ///
    /// Every manifest and blob is verified before it is committed to the
    /// store. The index is updated only when all of them are available.
    pub fn pull(&self, reference: &Reference) -> Result<Pulled, Error> {
        self.pull_with(reference, &CancelToken::new())
    }

    /// Like [`pull`](Self::pull), but it can be interrupted with `cancel`.
    pub fn pull_with(&self, reference: &Reference, cancel: &CancelToken) -> Result<Pulled, Error> {
        pull::pull(self, reference, cancel)
    }

    /// Upload an image from the store to its registry.
    ///
    /// Returns the digest of the uploaded manifest.
    pub fn push(&self, reference: &Reference) -> Result<Digest, Error> {
        self.push_with(reference, &CancelToken::new())
    }

    /// Like [`push`](Self::push), but it can be interrupted with `cancel`.
    pub fn push_with(&self, reference: &Reference, cancel: &CancelToken) -> Result<Digest, Error> {
        push::push(self, reference, cancel)
    }

    /// Point the tag in `target` to the image of `source`.
    ///
    /// `target` must have a tag, and no digest.
    pub fn tag(&self, source: &Reference, target: &Reference) -> Result<(), Error> {
        let tag = match (&target.tag, &target.digest) {
            (Some(tag), None) => tag,
            _ => return Err(ParseError::InvalidTag(target.to_string()).into()),
        };

        let (digest, removal) = self.index.tag(source, &target.repository, tag)?;

        log::debug!("{target} tagged as {digest}");
        self.collect(&removal);

        Ok(())
    }

    /// Delete a reference.
    ///
    /// When a tag is deleted, and it was the last tag of its repository
    /// for the image, the digest associations of the repository to the
    /// same image are deleted too.
    ///
    /// A digest can't be deleted while a tag in the same repository
    /// points to it, unless `force` is set. With `force`, those tags are
    /// also deleted.
    ///
    /// Blobs that are not used by any other image are removed from the
    /// store.
    pub fn delete(&self, reference: &Reference, force: bool) -> Result<Removal, Error> {
        let removal = self.index.delete(reference, force)?;
        self.collect(&removal);
        Ok(removal)
    }

    /// Delete an image by its ID.
    ///
    /// It fails with [`Error::InUse`] if there is any reference to the
    /// image, unless `force` is set.
    pub fn delete_image(&self, id: &ImageId, force: bool) -> Result<Removal, Error> {
        let removal = self.index.delete_image(id, force)?;
        self.collect(&removal);
        Ok(removal)
    }

    /// Find a local image.
    pub fn resolve(&self, reference: &Reference) -> Result<Resolved, Error> {
        self.index.resolve(reference)
    }

    /// Tags and digests of a repository.
    pub fn list(&self, repository: &Repository) -> Vec<ListEntry> {
        self.index.list(repository)
    }

    pub fn repositories(&self) -> Vec<Repository> {
        self.index.repositories()
    }

    fn collect(&self, removal: &Removal) {
        for reference in &removal.untagged {
            log::debug!("untagged: {reference}");
        }

        if !removal.blobs.is_empty() {
            self.index.collect(&self.store, removal);
        }
    }
}
