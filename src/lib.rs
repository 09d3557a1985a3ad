//! Pull, push, and store OCI images.
//!
//! Images are downloaded from registries that implement the [OCI
//! distribution API][api] (like Docker Hub). Every manifest and blob is
//! verified against its digest before it is added to the local store.
//!
//! Tags and digests are tracked in a reference-counted index. When the
//! last reference to an image is deleted, its blobs are removed from
//! the store, unless another image uses them.
//!
//! [api]: https://github.com/opencontainers/distribution-spec/blob/main/spec.md
//!
//! # Examples
//!
//! ```no_run
//! use oci_depot::{Distributor, Reference};
//!
//! let distributor = Distributor::builder("/tmp/images").build().unwrap();
//!
//! let reference = Reference::parse("debian:stable").unwrap();
//! let pulled = distributor.pull(&reference).unwrap();
//!
//! println!("{} -> {}", reference, pulled.digest);
//! ```

mod cancel;
mod digest;
mod distributor;
mod error;
mod event_handler;
mod http;
mod index;
mod manifests;
mod registry;
mod store;

pub mod reference;

pub use crate::digest::{verify, Digest, DigestAlgorithm, DigestError};
pub use cancel::CancelToken;
pub use distributor::{default_store_dir, Distributor, DistributorBuilder, Pulled};
pub use error::{Error, Result};
pub use event_handler::{EventHandler, NoEventHandler};
pub use http::{HttpTransport, HttpTransportBuilder};
pub use index::{ImageId, ImageRecord, Index, Lease, ListEntry, Removal, Resolved};
pub use manifests::{Descriptor, Manifest, MediaType};
pub use reference::{ParseError, Reference, Repository};
pub use registry::{ManifestResponse, RegistryClient, Retry, Transport, VerifiedManifest};
pub use store::{BlobStore, BlobWriter};
