use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

use crate::{
    error::{try_io, Error},
    http::HttpTransport,
    index::Index,
    manifests::{arch, DEFAULT_OS},
    registry::{RegistryClient, Retry, Transport},
    store::BlobStore,
    EventHandler, NoEventHandler,
};

use super::Distributor;

/// Maximum number of threads to download blobs in parallel.
const DEFAULT_PARALLEL_DOWNLOADS: usize = 8;

/// Builder for [`Distributor`].
///
/// # Examples
///
/// ```no_run
/// # use oci_depot::*;
/// let distributor = Distributor::builder("/var/lib/images")
///     .architecture("arm64")
///     .parallel_downloads(4)
///     .retry_attempts(3)
///     .build()
///     .unwrap();
///
/// distributor.pull(&Reference::parse("debian:stable").unwrap()).unwrap();
/// ```
pub struct DistributorBuilder {
    root: PathBuf,
    architecture: Option<String>,
    os: Option<String>,
    parallel_downloads: usize,
    retry: Retry,
    event_handler: Arc<dyn EventHandler>,
    transport: Option<Arc<dyn Transport>>,
}

impl DistributorBuilder {
    pub(super) fn new(root: PathBuf) -> Self {
        DistributorBuilder {
            root,
            architecture: None,
            os: None,
            parallel_downloads: DEFAULT_PARALLEL_DOWNLOADS,
            retry: Retry::default(),
            event_handler: Arc::new(NoEventHandler),
            transport: None,
        }
    }

    /// CPU architecture to select from image indexes.
    ///
    /// The default value is computed from the target of the current
    /// process.
    pub fn architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    /// Operating system to select from image indexes. The default value
    /// is `linux`.
    pub fn os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn parallel_downloads(mut self, threads: usize) -> Self {
        self.parallel_downloads = threads.max(1);
        self
    }

    /// Maximum number of attempts for requests that fail with a transient
    /// error.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry.attempts = attempts.max(1);
        self
    }

    /// Delay after the first failed attempt. It is doubled after every
    /// attempt.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn event_handler(mut self, event_handler: impl EventHandler) -> Self {
        self.event_handler = Arc::new(event_handler);
        self
    }

    /// Use a custom transport instead of [`HttpTransport`].
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Open the store in the root directory, and load its index.
    pub fn build(self) -> Result<Distributor, Error> {
        try_io!(&self.root, fs::create_dir_all(&self.root));

        let store = BlobStore::open(self.root.clone())?;
        let index = Index::open(&self.root)?;

        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(
                HttpTransport::builder()
                    .event_handler(Arc::clone(&self.event_handler))
                    .build(),
            ),
        };

        let client = RegistryClient::new(transport, self.retry, Arc::clone(&self.event_handler));

        Ok(Distributor {
            store,
            index,
            client,
            event_handler: self.event_handler,
            architecture: self.architecture.unwrap_or_else(|| arch::DEFAULT.to_owned()),
            os: self.os.unwrap_or_else(|| DEFAULT_OS.to_owned()),
            parallel_downloads: self.parallel_downloads,
        })
    }
}

/// Default location of the store.
///
/// It is `$OCI_DEPOT_ROOT` if the variable is defined. If not, it is
/// `oci-depot` in `$XDG_DATA_HOME`, or in `$HOME/.local/share`.
pub fn default_store_dir() -> Option<PathBuf> {
    if let Some(root) = env::var_os("OCI_DEPOT_ROOT") {
        return Some(PathBuf::from(root));
    }

    let data_home = match env::var_os("XDG_DATA_HOME") {
        Some(d) if !d.is_empty() => PathBuf::from(d),
        _ => PathBuf::from(env::var_os("HOME")?).join(".local/share"),
    };

    Some(data_home.join("oci-depot"))
}
