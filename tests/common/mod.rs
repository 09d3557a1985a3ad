#![allow(dead_code)]

use std::{path::Path, time::Duration};

use oci_depot::Distributor;

pub mod blobs;
pub mod registry;

pub const ARCH: &str = "ARCH";

pub const OS: &str = "OS";

/// Create a distributor with a short retry policy.
pub fn distributor(root: &Path) -> Distributor {
    Distributor::builder(root)
        .architecture(ARCH)
        .os(OS)
        .retry_attempts(3)
        .retry_backoff(Duration::from_millis(10))
        .build()
        .expect("Create distributor")
}
