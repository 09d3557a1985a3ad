use std::{
    cmp::min,
    collections::VecDeque,
    sync::{Mutex, PoisonError},
    thread,
};

use crate::{
    cancel::{CancelOnPanic, CancelToken},
    digest::Digest,
    error::Error,
    index::{ImageRecord, Removal},
    manifests::{select_platform, Descriptor, Manifest, ManifestContent},
    reference::{Reference, Repository},
    registry::VerifiedManifest,
};

use super::{Distributor, Pulled};

pub(super) fn pull(
    distributor: &Distributor,
    reference: &Reference,
    cancel: &CancelToken,
) -> Result<Pulled, Error> {
    let client = &distributor.client;
    let repository = &reference.repository;

    let digest = client.resolve(reference, cancel)?;
    let (manifests, manifest) = fetch_manifests(distributor, repository, &digest, cancel)?;

    // Manifests are stored with the blobs, so they are available for
    // pushes.
    let mut blobs: Vec<Digest> = manifests.iter().map(|m| m.digest.clone()).collect();
    blobs.extend(manifest.blobs().map(|b| b.digest.clone()));

    // Blobs can't be collected while the lease is alive. It must be taken
    // before checking which blobs are already in the store.
    let _lease = distributor.index.lease(&distributor.store, blobs);

    for verified in &manifests {
        if !distributor.store.exists(&verified.digest) {
            distributor.store.put(&verified.data, &verified.digest)?;
        }
    }

    let mut missing = Vec::new();
    for blob in manifest.blobs() {
        if distributor.store.exists(&blob.digest) {
            distributor.event_handler.blob_skipped(&blob.digest);
        } else if !missing.iter().any(|m: &&Descriptor| m.digest == blob.digest) {
            missing.push(blob);
        }
    }

    fetch_blobs(distributor, repository, &missing, cancel)?;

    let image_manifest = manifests
        .last()
        .map(|m| m.digest.clone())
        .unwrap_or_else(|| digest.clone());

    let record = ImageRecord::new(image_manifest, &manifest);
    let image = record.id.clone();

    // Nothing is committed if the operation was interrupted.
    cancel.check()?;

    let index = &distributor.index;
    let (removal, tagged): (Removal, bool) = match (&reference.tag, &reference.digest) {
        (Some(tag), None) => (index.commit_tag(repository, tag, &digest, record)?, true),

        (None, _) => (index.add_digest(repository, &digest, record)?, false),

        (Some(tag), Some(_)) => {
            // The tag is updated only if the registry still resolves it
            // to the same digest.
            let tag_reference = Reference::with_tag(repository.clone(), tag)?;
            match client.resolve(&tag_reference, cancel) {
                Ok(current) if current == digest => (
                    index.commit_tag_and_digest(repository, tag, &digest, record)?,
                    true,
                ),

                Ok(current) => {
                    log::warn!("{tag_reference} points to {current}; the tag is not updated");
                    (index.add_digest(repository, &digest, record)?, false)
                }

                Err(e) => {
                    log::warn!("can't resolve {tag_reference}: {e}; the tag is not updated");
                    (index.add_digest(repository, &digest, record)?, false)
                }
            }
        }
    };

    distributor.collect(&removal);

    log::debug!("pulled {reference} ({digest})");
    distributor.event_handler.finished();

    Ok(Pulled {
        reference: Reference::with_digest(repository.clone(), digest.clone()),
        digest,
        image,
        tagged,
    })
}

/// Download and verify the manifest for `digest`.
///
/// If it is an image index, the manifest for the configured platform is
/// downloaded too. Returns the verified manifests (the index first, if
/// any), and the image manifest.
fn fetch_manifests(
    distributor: &Distributor,
    repository: &Repository,
    digest: &Digest,
    cancel: &CancelToken,
) -> Result<(Vec<VerifiedManifest>, Manifest), Error> {
    let client = &distributor.client;
    let mut manifests = Vec::with_capacity(2);
    let mut digest = digest.clone();

    loop {
        let verified = client.fetch_manifest(repository, &digest, cancel)?;
        let content = ManifestContent::parse(verified.content_type, &verified.data)?;
        manifests.push(verified);

        match content {
            ManifestContent::Image(manifest) => return Ok((manifests, manifest)),

            // An index can't point to another index.
            ManifestContent::Index(_) if manifests.len() > 1 => {
                return Err(Error::MissingArchitecture);
            }

            ManifestContent::Index(entries) => {
                digest =
                    select_platform(&entries, &distributor.architecture, &distributor.os)?.clone();
            }
        }
    }
}

/// Download blobs in a thread pool.
///
/// The first failure stops the other downloads.
fn fetch_blobs(
    distributor: &Distributor,
    repository: &Repository,
    blobs: &[&Descriptor],
    cancel: &CancelToken,
) -> Result<(), Error> {
    if blobs.is_empty() {
        return Ok(());
    }

    distributor
        .event_handler
        .download_start(blobs.len(), blobs.iter().map(|b| b.size).sum());

    let pending: VecDeque<_> = blobs.iter().collect();
    let pending = Mutex::new(pending);

    let failed = cancel.child();
    let first_error = Mutex::new(None);

    thread::scope(|scope| {
        for _ in 0..min(distributor.parallel_downloads, blobs.len()) {
            scope.spawn(|| {
                let _tracker = CancelOnPanic(&failed);

                while !failed.is_cancelled() {
                    let Some(blob) = pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front()
                    else {
                        break;
                    };

                    let result =
                        distributor
                            .client
                            .fetch_blob(repository, &blob.digest, &distributor.store, &failed);

                    if let Err(e) = result {
                        first_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(e);

                        failed.cancel();
                    }
                }
            });
        }
    });

    match first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
