use oci_depot::{Descriptor, Digest, Manifest, MediaType};

#[derive(Debug, Clone)]
pub struct Blob {
    pub media_type: MediaType,
    pub digest: Digest,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(media_type: MediaType, data: impl Into<Vec<u8>>) -> Blob {
        let data = data.into();

        Blob {
            media_type,
            digest: Digest::sha256(&data),
            data,
        }
    }

    pub fn config(data: &str) -> Blob {
        Blob::new(MediaType::OciConfig, data.as_bytes())
    }

    pub fn layer(data: &str) -> Blob {
        Blob::new(MediaType::OciFsTarGzip, data.as_bytes())
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type,
            digest: self.digest.clone(),
            size: self.data.len() as u64,
        }
    }
}

/// Serialize the manifest of an image.
pub fn manifest(config: &Blob, layers: &[Blob]) -> Vec<u8> {
    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(MediaType::OciManifestV1),
        config: config.descriptor(),
        layers: layers.iter().map(Blob::descriptor).collect(),
    };

    serde_json::to_vec_pretty(&manifest).expect("Serialize manifest")
}
