use std::fmt::Display;

use crate::digest::Digest;

/// Handler to receive notifications for events during pulls and pushes.
///
/// All methods are optional.
#[expect(unused_variables)]
pub trait EventHandler: Send + Sync + 'static {
    /// HTTP request to the registry.
    fn registry_request(&self, method: &str, url: &str) {}

    /// Registry requires an [authentication token][token].
    ///
    /// [token]: https://distribution.github.io/distribution/spec/auth/token/
    fn registry_auth(&self, url: &str) {}

    /// A request failed with a transient error, and it will be repeated.
    ///
    /// `attempt` is the number of the failed attempt, starting at 1.
    fn retry(&self, what: &str, attempt: u32, cause: &dyn Display) {}

    /// Start to download the blobs of the image.
    ///
    /// `blobs` is the number of blobs to download, and `bytes` their
    /// total size. Blobs already present in the store are not included.
    fn download_start(&self, blobs: usize, bytes: u64) {}

    /// Some data (in `bytes`) has been received.
    ///
    /// This method is invoked very frequently.
    fn download_progress_bytes(&self, bytes: usize) {}

    /// A blob is not transferred because the destination already has it.
    fn blob_skipped(&self, digest: &Digest) {}

    /// A downloaded blob was verified, and added to the store.
    fn blob_committed(&self, digest: &Digest) {}

    /// Start to upload the blobs of an image.
    fn upload_start(&self, blobs: usize, bytes: u64) {}

    /// A blob was uploaded to the registry.
    fn blob_uploaded(&self, digest: &Digest) {}

    /// The operation finished successfully.
    fn finished(&self) {}
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}
