//! Pull and push protocol on top of a [`Transport`].
//!
//! Every manifest and blob received from a registry is verified against
//! its digest before it is used.

mod retry;
mod transport;

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use crate::{
    cancel::CancelToken,
    digest::Digest,
    error::{try_io, Error},
    manifests::{MediaType, MAX_MANIFEST_SIZE},
    reference::{Reference, Repository},
    store::BlobStore,
    EventHandler,
};

pub use retry::Retry;
pub use transport::{ManifestResponse, Transport};

/// Size of the buffer to copy blobs.
const CHUNK_SIZE: usize = 32 * 1024;

/// Manifest verified against its digest.
#[derive(Debug)]
pub struct VerifiedManifest {
    pub digest: Digest,
    pub content_type: Option<MediaType>,
    pub data: Vec<u8>,
}

/// Client for the pull/push protocol of a registry.
pub struct RegistryClient {
    transport: Arc<dyn Transport>,
    retry: Retry,
    event_handler: Arc<dyn EventHandler>,
}

impl RegistryClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: Retry,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        RegistryClient {
            transport,
            retry,
            event_handler,
        }
    }

    fn retry<T>(
        &self,
        what: &str,
        cancel: &CancelToken,
        f: impl FnMut() -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.retry.run(what, cancel, &*self.event_handler, f)
    }

    /// Find the manifest digest for a reference.
    ///
    /// If the reference has a digest, it is returned without any request.
    /// If not, the tag is resolved with a `HEAD` request. If the registry
    /// does not send the digest in the response, the manifest is
    /// downloaded, and its digest is computed from the received bytes.
    pub fn resolve(&self, reference: &Reference, cancel: &CancelToken) -> Result<Digest, Error> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let tag = reference
            .tag
            .as_deref()
            .ok_or_else(|| Error::NotFound(reference.to_string()))?;

        let repository = &reference.repository;
        let what = reference.to_string();

        if let Some(digest) = self.retry(&what, cancel, || {
            self.transport.head_manifest(repository, tag)
        })? {
            log::debug!("{reference} resolved to {digest}");
            return Ok(digest);
        }

        let response = self.retry(&what, cancel, || {
            self.transport
                .get_manifest(repository, tag, MAX_MANIFEST_SIZE)
        })?;

        let digest = Digest::sha256(&response.data);
        log::debug!("{reference} resolved to {digest} from the manifest content");

        Ok(digest)
    }

    /// Download the manifest for `digest`, and verify it.
    ///
    /// A mismatch is reported as [`Error::ManifestVerificationFailed`].
    pub fn fetch_manifest(
        &self,
        repository: &Repository,
        digest: &Digest,
        cancel: &CancelToken,
    ) -> Result<VerifiedManifest, Error> {
        let reference = Reference::with_digest(repository.clone(), digest.clone());

        let response = self.retry(&reference.to_string(), cancel, || {
            self.transport
                .get_manifest(repository, digest.source(), MAX_MANIFEST_SIZE)
        })?;

        digest
            .verify(&response.data)
            .map_err(|e| Error::from(e).manifest_context(&reference))?;

        Ok(VerifiedManifest {
            digest: digest.clone(),
            content_type: response.content_type,
            data: response.data,
        })
    }

    /// Download a blob to the store.
    ///
    /// The data is written to a staged file, which is committed only if
    /// the digest of the received data is `digest`. A mismatch is
    /// reported as [`Error::LayerVerificationFailed`].
    pub fn fetch_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        store: &BlobStore,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let reference = Reference::with_digest(repository.clone(), digest.clone());
        let what = reference.to_string();

        self.retry(&what, cancel, || {
            let mut input = self.transport.get_blob(repository, digest)?;
            let mut output = store.stage(digest)?;

            let mut buffer = vec![0; CHUNK_SIZE];
            loop {
                cancel.check()?;

                let n = match input.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(crate::http::transient(&what, e)),
                };

                self.event_handler.download_progress_bytes(n);

                try_io!(store.root(), output.write_all(&buffer[..n]));
            }

            store.commit(output).map(drop)
        })
        .map_err(|e| e.layer_context(&reference))?;

        self.event_handler.blob_committed(digest);

        Ok(())
    }

    /// Upload a blob from the store, unless the registry already has it.
    ///
    /// Returns `true` if the blob was uploaded.
    pub fn push_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        store: &BlobStore,
        cancel: &CancelToken,
    ) -> Result<bool, Error> {
        let what = Reference::with_digest(repository.clone(), digest.clone()).to_string();

        if self.retry(&what, cancel, || self.transport.has_blob(repository, digest))? {
            self.event_handler.blob_skipped(digest);
            return Ok(false);
        }

        self.retry(&what, cancel, || {
            let size = store.size(digest)?;
            let mut input = CancelReader {
                inner: io::BufReader::new(store.read(digest)?),
                cancel,
            };

            self.transport
                .put_blob(repository, digest, size, &mut input)
        })?;

        log::debug!("blob uploaded: {what}");
        self.event_handler.blob_uploaded(digest);

        Ok(true)
    }

    /// Upload a manifest, and compare the digest returned by the registry
    /// with the digest of `data`.
    pub fn push_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        media_type: MediaType,
        data: &[u8],
        cancel: &CancelToken,
    ) -> Result<Digest, Error> {
        let expected = Digest::sha256(data);
        let what = format!("{repository}:{reference}");

        let returned = self.retry(&what, cancel, || {
            self.transport
                .put_manifest(repository, reference, media_type, data)
        })?;

        match returned {
            Some(actual) if actual != expected => Err(Error::DigestMismatch { expected, actual }),
            _ => Ok(expected),
        }
    }
}

/// Stop an upload when the token is cancelled.
struct CancelReader<'a, R> {
    inner: R,
    cancel: &'a CancelToken,
}

impl<R: Read> Read for CancelReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, Error::Interrupted));
        }

        self.inner.read(buf)
    }
}
