use std::{io, path::PathBuf};

use crate::{
    digest::{Digest, DigestError},
    manifests::MediaType,
    reference::ParseError,
};

/// Errors from the operations of this crate.
///
/// Verification failures carry both the expected and the computed digest.
/// Only [`Error::TransientTransport`] is retryable; see
/// [`Error::is_retryable`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Invalid reference: {0}")]
    MalformedReference(#[from] ParseError),

    #[error("Invalid digest: {0}")]
    MalformedDigest(DigestError),

    #[error("{0}: not found")]
    NotFound(String),

    #[error("manifest verification failed for digest {expected} ({reference}): got {actual}")]
    ManifestVerificationFailed {
        reference: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("filesystem layer verification failed for digest {expected} ({reference}): got {actual}")]
    LayerVerificationFailed {
        reference: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("Digest mismatch. Expected {expected}, got {actual}.")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("{reference} is in use by {holders:?}")]
    InUse {
        reference: String,
        holders: Vec<String>,
    },

    #[error("Transient failure in {url}: {message}")]
    TransientTransport { url: String, message: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("HTTP request failed: {0}")]
    Transport(#[from] Box<ureq::Error>),

    #[error("Index changed during commit: {0}")]
    IndexConflict(String),

    #[error("I/O error in {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing authentication tokens.")]
    MissingTokens,

    #[error("Missing or invalid Content-Type.")]
    MissingContentType,

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(MediaType),

    #[error("No image for the architecture.")]
    MissingArchitecture,

    #[error("Manifest is larger than {0} bytes.")]
    ManifestTooLarge(u64),

    #[error("Operation interrupted.")]
    Interrupted,
}

impl Error {
    /// `true` if the operation may succeed if it is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientTransport { .. })
    }

    /// Add the reference of the operation to a digest mismatch found
    /// when a manifest is verified.
    pub(crate) fn manifest_context(self, reference: &impl ToString) -> Error {
        match self {
            Error::DigestMismatch { expected, actual } => Error::ManifestVerificationFailed {
                reference: reference.to_string(),
                expected,
                actual,
            },

            e => e,
        }
    }

    /// Add the reference of the operation to a digest mismatch found
    /// when a layer (or the configuration) is verified.
    pub(crate) fn layer_context(self, reference: &impl ToString) -> Error {
        match self {
            Error::DigestMismatch { expected, actual } => Error::LayerVerificationFailed {
                reference: reference.to_string(),
                expected,
                actual,
            },

            e => e,
        }
    }
}

impl From<DigestError> for Error {
    fn from(value: DigestError) -> Self {
        match value {
            DigestError::Mismatch { expected, actual } => Error::DigestMismatch { expected, actual },
            e => Error::MalformedDigest(e),
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(value: ureq::Error) -> Self {
        Error::Transport(Box::new(value))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

macro_rules! try_io {
    ($path:expr, $e:expr $(,)?) => {
        $e.map_err(|e| $crate::error::Error::Io(::std::io::Error::from(e), $path.into()))?
    };
}

// Make visible to mods.
pub(crate) use try_io;

#[test]
fn mismatch_context() {
    use crate::digest::fixtures;
    use std::str::FromStr;

    let err = Error::from(DigestError::Mismatch {
        expected: Digest::from_str(fixtures::ABC).unwrap(),
        actual: Digest::from_str(fixtures::ABCX).unwrap(),
    });

    let msg = err.layer_context(&"foo/bar").to_string();
    assert!(msg.starts_with(&format!(
        "filesystem layer verification failed for digest {}",
        fixtures::ABC
    )));
    assert!(msg.contains(fixtures::ABCX));

    assert!(matches!(
        Error::from(DigestError::InvalidValue),
        Error::MalformedDigest(_)
    ));
}
