use std::io::Read;

use crate::{digest::Digest, error::Error, manifests::MediaType, reference::Repository};

/// Manifest received from a registry.
#[derive(Debug)]
pub struct ManifestResponse {
    /// Media type from the `Content-Type` header, if it is known.
    pub content_type: Option<MediaType>,

    /// Value of the `Docker-Content-Digest` header.
    pub digest: Option<Digest>,

    pub data: Vec<u8>,
}

/// Requests to a registry that implements the [OCI distribution
/// API][api].
///
/// Implementations must report failures that may succeed if the request
/// is repeated (connection failures, I/O errors, and HTTP responses with
/// status 429, 502, 503, or 504) as [`Error::TransientTransport`], and
/// missing objects as [`Error::NotFound`].
///
/// [api]: https://github.com/opencontainers/distribution-spec/blob/main/spec.md
pub trait Transport: Send + Sync {
    /// `HEAD /v2/<name>/manifests/<reference>`.
    ///
    /// Returns the `Docker-Content-Digest` header, if the registry sends it.
    fn head_manifest(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<Option<Digest>, Error>;

    /// `GET /v2/<name>/manifests/<reference>`.
    ///
    /// It fails with [`Error::ManifestTooLarge`] if the body is larger than
    /// `max_size` bytes.
    fn get_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        max_size: u64,
    ) -> Result<ManifestResponse, Error>;

    /// `PUT /v2/<name>/manifests/<reference>`.
    ///
    /// Returns the digest computed by the registry, if it sends one.
    fn put_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        media_type: MediaType,
        data: &[u8],
    ) -> Result<Option<Digest>, Error>;

    /// `GET /v2/<name>/blobs/<digest>`.
    ///
    /// The content is not verified.
    fn get_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
    ) -> Result<Box<dyn Read + Send>, Error>;

    /// `HEAD /v2/<name>/blobs/<digest>`.
    fn has_blob(&self, repository: &Repository, digest: &Digest) -> Result<bool, Error>;

    /// Upload a blob with `POST /v2/<name>/blobs/uploads/`, followed by a
    /// `PUT` to the upload location.
    fn put_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        size: u64,
        data: &mut dyn Read,
    ) -> Result<(), Error>;
}
