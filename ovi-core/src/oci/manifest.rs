use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::sha256;

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCTET_STREAM_MEDIA_TYPE: &str = "application/octet-stream";
pub const DISK_CHUNK_MEDIA_TYPE: &str = "application/octet-stream+lz4";

pub const ANNOTATION_UNCOMPRESSED_SIZE: &str = "org.trycua.lume.uncompressed-size";
pub const ANNOTATION_UNCOMPRESSED_DIGEST: &str = "org.trycua.lume.uncompressed-content-digest";
pub const ANNOTATION_DISK_SIZE: &str = "org.trycua.lume.uncompressed-disk-size";
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

// Older images spell the annotations differently; accepted on read,
// written alongside the current keys for their benefit.
pub const ANNOTATION_UNCOMPRESSED_SIZE_LEGACY: &str = "com.trycua.lume.disk.uncompressed_size";
pub const ANNOTATION_UNCOMPRESSED_DIGEST_LEGACY: &str = "com.trycua.lume.disk.uncompressed_digest";
pub const ANNOTATION_DISK_SIZE_LEGACY: &str = "com.trycua.lume.disk.uncompressed_size";

/// `{mediaType, size, digest[, annotations]}` tuple identifying one blob.
///
/// Annotations use a BTreeMap so serialized key order is stable and the
/// manifest digest reproducible.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciDescriptor {
    pub fn annotation(&self, key: &str, legacy: &str) -> Option<&str> {
        let annotations = self.annotations.as_ref()?;
        annotations
            .get(key)
            .or_else(|| annotations.get(legacy))
            .map(String::as_str)
    }

    /// Pre-compression byte count, when the producer recorded one.
    pub fn uncompressed_size(&self) -> Option<u64> {
        self.annotation(ANNOTATION_UNCOMPRESSED_SIZE, ANNOTATION_UNCOMPRESSED_SIZE_LEGACY)?
            .parse()
            .ok()
    }

    /// Digest of the pre-compression bytes, when recorded.
    pub fn uncompressed_digest(&self) -> Option<&str> {
        self.annotation(
            ANNOTATION_UNCOMPRESSED_DIGEST,
            ANNOTATION_UNCOMPRESSED_DIGEST_LEGACY,
        )
    }
}

/// OCI image manifest v1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<OciDescriptor>,
    pub layers: Vec<OciDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciManifest {
    pub fn new(
        config: Option<OciDescriptor>,
        layers: Vec<OciDescriptor>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers,
            annotations: if annotations.is_empty() { None } else { Some(annotations) },
        }
    }

    /// Image-level uncompressed disk size annotation, when present.
    pub fn uncompressed_disk_size(&self) -> Option<u64> {
        let annotations = self.annotations.as_ref()?;
        annotations
            .get(ANNOTATION_DISK_SIZE)
            .or_else(|| annotations.get(ANNOTATION_DISK_SIZE_LEGACY))?
            .parse()
            .ok()
    }

    /// The exact bytes PUT to the registry, cached verbatim, and digested
    /// for the manifest id. Field order is fixed and annotation maps are
    /// sorted, so the output is stable for identical inputs.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn digest(&self) -> Result<String> {
        Ok(sha256::digest_bytes(&self.to_canonical_json()?))
    }
}

/// Closed routing over layer media types; anything unrecognised is skipped
/// with a warning rather than failing the transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Config,
    Nvram,
    DiskChunk,
    /// A single uncompressed disk published without a config descriptor.
    WholeDisk,
    Unknown,
}

pub fn classify_layer(manifest: &OciManifest, layer: &OciDescriptor) -> LayerKind {
    match layer.media_type.as_str() {
        CONFIG_MEDIA_TYPE => LayerKind::Config,
        DISK_CHUNK_MEDIA_TYPE => LayerKind::DiskChunk,
        OCTET_STREAM_MEDIA_TYPE => {
            if manifest.config.is_some() {
                LayerKind::Nvram
            } else {
                LayerKind::WholeDisk
            }
        }
        _ => LayerKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(media_type: &str) -> OciDescriptor {
        OciDescriptor {
            media_type: media_type.to_string(),
            size: 1,
            digest: "sha256:0".to_string(),
            annotations: None,
        }
    }

    fn manifest_with_config() -> OciManifest {
        OciManifest::new(
            Some(descriptor(CONFIG_MEDIA_TYPE)),
            vec![descriptor(OCTET_STREAM_MEDIA_TYPE), descriptor(DISK_CHUNK_MEDIA_TYPE)],
            BTreeMap::new(),
        )
    }

    #[test]
    fn octet_stream_routing_depends_on_config() {
        let with = manifest_with_config();
        assert_eq!(classify_layer(&with, &with.layers[0]), LayerKind::Nvram);
        assert_eq!(classify_layer(&with, &with.layers[1]), LayerKind::DiskChunk);

        let without = OciManifest::new(None, vec![descriptor(OCTET_STREAM_MEDIA_TYPE)], BTreeMap::new());
        assert_eq!(classify_layer(&without, &without.layers[0]), LayerKind::WholeDisk);

        assert_eq!(
            classify_layer(&with, &descriptor("application/x-unheard-of")),
            LayerKind::Unknown
        );
    }

    #[test]
    fn legacy_annotations_are_read() {
        let mut d = descriptor(DISK_CHUNK_MEDIA_TYPE);
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_UNCOMPRESSED_SIZE_LEGACY.to_string(), "1234".to_string());
        annotations.insert(
            ANNOTATION_UNCOMPRESSED_DIGEST_LEGACY.to_string(),
            "sha256:feed".to_string(),
        );
        d.annotations = Some(annotations);

        assert_eq!(d.uncompressed_size(), Some(1234));
        assert_eq!(d.uncompressed_digest(), Some("sha256:feed"));
    }

    #[test]
    fn current_annotation_wins_over_legacy() {
        let mut d = descriptor(DISK_CHUNK_MEDIA_TYPE);
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_UNCOMPRESSED_SIZE.to_string(), "10".to_string());
        annotations.insert(ANNOTATION_UNCOMPRESSED_SIZE_LEGACY.to_string(), "99".to_string());
        d.annotations = Some(annotations);
        assert_eq!(d.uncompressed_size(), Some(10));
    }

    #[test]
    fn canonical_bytes_are_stable() {
        let m = manifest_with_config();
        let a = m.to_canonical_json().unwrap();
        let b = m.to_canonical_json().unwrap();
        assert_eq!(a, b);
        assert_eq!(m.digest().unwrap(), crate::hash::sha256::digest_bytes(&a));

        let reparsed: OciManifest = serde_json::from_slice(&a).unwrap();
        assert_eq!(reparsed, m);
        assert_eq!(reparsed.to_canonical_json().unwrap(), a);
    }
}
