//! Manifests and image indexes.
//!
//! Refs:
//!
//! * <https://distribution.github.io/distribution/spec/manifest-v2-2/>
//! * <https://github.com/opencontainers/image-spec/blob/main/manifest.md>
//! * <https://github.com/opencontainers/image-spec/blob/main/image-index.md>

mod mediatype;

use crate::{digest::Digest, error::Error};

pub use mediatype::MediaType;

/// Maximum size of a manifest downloaded from a registry.
pub(crate) const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Reference to a blob inside a manifest.
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: MediaType,
    pub digest: Digest,
    pub size: u64,
}

/// Manifest of a single image: its configuration and its layers.
#[derive(serde::Deserialize, serde::Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Digests of the configuration and the layers, in that order.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(&self.layers)
    }
}

/// Entry of an image index (or Docker manifest list).
#[derive(serde::Deserialize, Debug)]
pub(crate) struct IndexEntry {
    pub digest: Digest,

    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(serde::Deserialize, Debug)]
pub(crate) struct Platform {
    pub architecture: String,
    pub os: String,
}

/// Content of a verified manifest blob.
#[derive(Debug)]
pub(crate) enum ManifestContent {
    Image(Manifest),
    Index(Vec<IndexEntry>),
}

impl ManifestContent {
    /// Parse a manifest, using `content_type` if the registry sent it, or
    /// the `mediaType` field in the document if not.
    pub fn parse(content_type: Option<MediaType>, data: &[u8]) -> Result<Self, Error> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Probe {
            media_type: Option<MediaType>,
        }

        let media_type = match content_type {
            Some(m) => m,
            None => serde_json::from_slice::<Probe>(data)?
                .media_type
                .ok_or(Error::MissingContentType)?,
        };

        #[derive(serde::Deserialize)]
        struct List {
            manifests: Vec<IndexEntry>,
        }

        match media_type {
            m if m.is_index() => {
                let List { manifests } = serde_json::from_slice(data)?;
                Ok(ManifestContent::Index(manifests))
            }

            m if m.is_image_manifest() => Ok(ManifestContent::Image(serde_json::from_slice(data)?)),

            unknown => Err(Error::UnsupportedMediaType(unknown)),
        }
    }
}

/// Find the digest in an image index for the `architecture`/`os` pair.
pub(crate) fn select_platform<'a>(
    entries: &'a [IndexEntry],
    architecture: &str,
    os: &str,
) -> Result<&'a Digest, Error> {
    entries
        .iter()
        .find(|i| {
            i.platform
                .as_ref()
                .is_some_and(|p| p.architecture == architecture && p.os == os)
        })
        .map(|i| &i.digest)
        .ok_or(Error::MissingArchitecture)
}

pub(crate) mod arch {
    #[cfg(target_arch = "aarch64")]
    pub const DEFAULT: &str = "arm64";

    #[cfg(target_arch = "x86_64")]
    pub const DEFAULT: &str = "amd64";

    #[cfg(target_arch = "riscv64")]
    pub const DEFAULT: &str = "riscv64";

    #[cfg(not(any(
        target_arch = "aarch64",
        target_arch = "x86_64",
        target_arch = "riscv64"
    )))]
    pub const DEFAULT: &str = std::env::consts::ARCH;
}

pub(crate) const DEFAULT_OS: &str = "linux";

#[test]
fn parse_image_manifest() {
    use crate::digest::fixtures;

    let json = format!(
        r#"{{
          "schemaVersion": 2,
          "mediaType": "application/vnd.oci.image.manifest.v1+json",
          "config": {{
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "{abc}",
            "size": 3
          }},
          "layers": [
            {{
              "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
              "digest": "{abcx}",
              "size": 4
            }}
          ]
        }}"#,
        abc = fixtures::ABC,
        abcx = fixtures::ABCX,
    );

    let ManifestContent::Image(manifest) = ManifestContent::parse(None, json.as_bytes()).unwrap()
    else {
        panic!("Expected an image manifest");
    };

    let digests: Vec<_> = manifest.blobs().map(|b| b.digest.source()).collect();
    assert_eq!(digests, [fixtures::ABC, fixtures::ABCX]);
}

#[test]
fn select_platform_from_index() {
    use crate::digest::fixtures;

    let json = format!(
        r#"{{
          "manifests": [
            {{ "digest": "{abc}", "platform": {{ "architecture": "arm64", "os": "linux" }} }},
            {{ "digest": "{abcx}", "platform": {{ "architecture": "amd64", "os": "linux" }} }}
          ]
        }}"#,
        abc = fixtures::ABC,
        abcx = fixtures::ABCX,
    );

    let content = ManifestContent::parse(Some(MediaType::OciImageIndex), json.as_bytes());
    let Ok(ManifestContent::Index(entries)) = content else {
        panic!("Expected an index");
    };

    assert_eq!(
        select_platform(&entries, "amd64", "linux").unwrap().source(),
        fixtures::ABCX
    );

    assert!(matches!(
        select_platform(&entries, "s390x", "linux"),
        Err(Error::MissingArchitecture)
    ));
}

#[test]
fn reject_unknown_manifests() {
    assert!(matches!(
        ManifestContent::parse(Some(MediaType::OciConfig), b"{}"),
        Err(Error::UnsupportedMediaType(MediaType::OciConfig))
    ));

    assert!(matches!(
        ManifestContent::parse(None, b"{}"),
        Err(Error::MissingContentType)
    ));
}
