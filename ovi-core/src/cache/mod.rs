use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::error::Result;
use crate::hash::sha256;
use crate::oci::manifest::OciManifest;

/// `sha256:<hex>` digests double as file and directory names with the
/// colon swapped out.
pub fn manifest_id(digest: &str) -> String {
    digest.replace(':', "_")
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheMetadata {
    pub image: String,
    #[serde(rename = "manifestId")]
    pub manifest_id: String,
    pub timestamp: String,
}

/// Content-addressed store under `<cache_root>/ghcr/<org>/<manifestId>/`:
/// `manifest.json`, `metadata.json`, and one file per layer named by its
/// digest. Both pull and push resume through it.
pub struct ImageCache {
    root: PathBuf,
    enabled: bool,
    _scratch: Option<tempfile::TempDir>,
}

impl ImageCache {
    pub fn open(cache_root: &Path, organization: &str) -> Result<Self> {
        let root = cache_root.join("ghcr").join(organization);
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            enabled: true,
            _scratch: None,
        })
    }

    /// A cache whose reads always miss and whose metadata writes are
    /// skipped. Layer files still get a scratch home (removed on drop) so
    /// transfers and in-flight dedup behave identically.
    pub fn disabled() -> Result<Self> {
        let scratch = tempfile::tempdir()?;
        Ok(Self {
            root: scratch.path().to_path_buf(),
            enabled: false,
            _scratch: Some(scratch),
        })
    }

    fn dir(&self, manifest_id: &str) -> PathBuf {
        self.root.join(manifest_id)
    }

    fn manifest_path(&self, manifest_id: &str) -> PathBuf {
        self.dir(manifest_id).join("manifest.json")
    }

    fn metadata_path(&self, manifest_id: &str) -> PathBuf {
        self.dir(manifest_id).join("metadata.json")
    }

    pub fn layer_path(&self, manifest_id: &str, digest: &str) -> PathBuf {
        self.dir(manifest_id).join(digest.replace(':', "_"))
    }

    pub fn has_manifest(&self, manifest_id: &str) -> bool {
        self.enabled && self.manifest_path(manifest_id).is_file()
    }

    pub fn load_manifest(&self, manifest_id: &str) -> Option<OciManifest> {
        if !self.enabled {
            return None;
        }
        let bytes = fs::read(self.manifest_path(manifest_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn has_layer(&self, manifest_id: &str, digest: &str) -> bool {
        self.enabled && self.layer_path(manifest_id, digest).is_file()
    }

    /// Purge and recreate the manifest directory.
    pub fn reset(&self, manifest_id: &str) -> Result<()> {
        let dir = self.dir(manifest_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    /// Persist the exact manifest bytes as served; recomputing the digest
    /// from this file reproduces the manifest id.
    pub fn write_manifest(&self, manifest_id: &str, bytes: &[u8]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        fs::create_dir_all(self.dir(manifest_id))?;
        fs::write(self.manifest_path(manifest_id), bytes)?;
        Ok(())
    }

    pub fn write_metadata(&self, image: &str, manifest_id: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let meta = CacheMetadata {
            image: image.to_string(),
            manifest_id: manifest_id.to_string(),
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?,
        };
        fs::create_dir_all(self.dir(manifest_id))?;
        fs::write(
            self.metadata_path(manifest_id),
            serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(())
    }

    /// Valid iff the cached manifest's layer list matches and every layer
    /// file is present. Anything off downgrades to a miss, never an error.
    pub fn validate(&self, manifest_id: &str, manifest: &OciManifest) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(cached) = self.load_manifest(manifest_id) else {
            return false;
        };
        if cached.layers != manifest.layers {
            return false;
        }
        manifest
            .layers
            .iter()
            .all(|l| self.has_layer(manifest_id, &l.digest))
    }

    /// Content check for one cached layer: the file must hash to its
    /// filename-derived digest. Enforced lazily on use, not on every read.
    pub fn verify_layer(&self, manifest_id: &str, digest: &str) -> bool {
        match sha256::digest_file(&self.layer_path(manifest_id, digest)) {
            Ok(actual) => actual == digest,
            Err(_) => false,
        }
    }

    fn read_metadata(&self, dir: &Path) -> Option<CacheMetadata> {
        let bytes = fs::read(dir.join("metadata.json")).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Remove sibling manifest directories that name the same image under
    /// a different manifest id. Returns how many were dropped.
    pub fn gc_except(&self, current_manifest_id: &str, image: &str) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            if dir.file_name().is_some_and(|n| n == current_manifest_id) {
                continue;
            }
            let Some(meta) = self.read_metadata(&dir) else {
                continue;
            };
            if meta.image == image && meta.manifest_id != current_manifest_id {
                debug!(dir = %dir.display(), "removing superseded manifest directory");
                fs::remove_dir_all(&dir)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
