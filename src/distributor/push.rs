use crate::{
    cancel::CancelToken,
    digest::Digest,
    error::Error,
    index::Resolved,
    manifests::{Manifest, MediaType},
    reference::Reference,
};

use super::Distributor;

/// Upload the configuration, the layers, and the manifest of the image
/// of `reference`.
///
/// If the reference was pulled from an image index, only the manifest for
/// the local platform is available, so that manifest is pushed instead
/// of the index.
pub(super) fn push(
    distributor: &Distributor,
    reference: &Reference,
    cancel: &CancelToken,
) -> Result<Digest, Error> {
    let Resolved { digest, record } = distributor.index.resolve(reference)?;

    let _lease = distributor.index.lease(&distributor.store, record.blobs().cloned());

    if digest != record.manifest {
        log::warn!(
            "{reference} is an image index; push manifest {} instead",
            record.manifest
        );
    }

    let data = distributor.store.read_to_vec(&record.manifest)?;
    let manifest: Manifest = serde_json::from_slice(&data)?;
    let media_type = manifest.media_type.unwrap_or(MediaType::OciManifestV1);

    let client = &distributor.client;
    let store = &distributor.store;
    let repository = &reference.repository;

    distributor
        .event_handler
        .upload_start(1 + manifest.layers.len(), manifest.blobs().map(|b| b.size).sum());

    for blob in manifest.blobs() {
        cancel.check()?;
        client.push_blob(repository, &blob.digest, store, cancel)?;
    }

    let target = match &reference.tag {
        Some(tag) => tag.clone(),
        None => record.manifest.to_string(),
    };

    let pushed = client.push_manifest(repository, &target, media_type, &data, cancel)?;

    log::debug!("pushed {repository}:{target} ({pushed})");
    distributor.event_handler.finished();

    Ok(pushed)
}
