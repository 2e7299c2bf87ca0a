use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{self, ImageCache};
use crate::codec::lz4f::{self, Lz4};
use crate::codec::store::Store;
use crate::codec::Compressor;
use crate::config::RegistryConfig;
use crate::error::{OviError, Result};
use crate::oci::client::RegistryClient;
use crate::oci::manifest::{self, LayerKind, OciDescriptor, OciManifest};
use crate::oci::reference::ImageReference;
use crate::sparse::writer::SparseWriter;
use crate::transfer::{InflightSet, PartsCollector, TransferProgress, worker_count};

/// How long a dedup waiter will poll for another task's download.
const DEDUP_WAIT: Duration = Duration::from_secs(3600);

#[derive(Clone, Default)]
pub struct PullOptions {
    /// Directory name for the reconstructed VM; defaults to `name_tag`.
    pub vm_name: Option<String>,
    /// Parent directory receiving the VM; defaults to `<cache_root>/vms`.
    pub location: Option<PathBuf>,
    /// Cap on concurrent layer tasks; defaults to `worker_count()`.
    pub concurrency: Option<usize>,
    pub progress: Option<Arc<TransferProgress>>,
}

pub struct PullOutcome {
    pub vm_dir: PathBuf,
    pub manifest_id: String,
    /// True when every layer came out of the local cache (zero blob GETs).
    pub reused_cache: bool,
}

/// One manifest layer routed by media type. Disk chunks are numbered by
/// their position among chunk layers in manifest order; reassembly looks
/// parts up by that index, so task completion order never matters.
#[derive(Clone)]
struct LayerJob {
    descriptor: OciDescriptor,
    kind: LayerKind,
    chunk_index: Option<usize>,
}

fn plan_layers(m: &OciManifest) -> Vec<LayerJob> {
    let mut next_chunk = 0usize;
    m.layers
        .iter()
        .map(|layer| {
            let kind = manifest::classify_layer(m, layer);
            let chunk_index = match kind {
                LayerKind::DiskChunk => {
                    let index = next_chunk;
                    next_chunk += 1;
                    Some(index)
                }
                _ => None,
            };
            LayerJob {
                descriptor: layer.clone(),
                kind,
                chunk_index,
            }
        })
        .collect()
}

/// Reconstruct the VM directory for `image` ("name:tag") from the
/// registry, reusing the content-addressed cache when it is valid.
pub async fn pull(
    config: &RegistryConfig,
    image: &str,
    opts: Option<&PullOptions>,
) -> Result<PullOutcome> {
    let default_opts = PullOptions::default();
    let opts = opts.unwrap_or(&default_opts);

    let reference = ImageReference::parse(image)?;
    let repository = reference.repository(&config.organization);

    let mut client = RegistryClient::new(&config.host)?;
    client.authenticate(&repository, false).await?;
    let client = Arc::new(client);

    let fetched = client.fetch_manifest(&repository, &reference.tag).await?;
    let manifest_id = cache::manifest_id(&fetched.digest);
    info!(
        image,
        %manifest_id,
        layers = fetched.manifest.layers.len(),
        "fetched manifest"
    );

    let image_cache = if config.cache_enabled {
        ImageCache::open(&config.cache_root, &config.organization)?
    } else {
        ImageCache::disabled()?
    };
    let image_cache = Arc::new(image_cache);

    let jobs = plan_layers(&fetched.manifest);
    let progress = opts.progress.clone().unwrap_or_default();
    let planned: Vec<&LayerJob> = jobs.iter().filter(|j| j.kind != LayerKind::Unknown).collect();
    progress.add_total(
        planned.iter().map(|j| j.descriptor.size).sum(),
        planned.len() as u64,
    );

    let cache_valid = image_cache.validate(&manifest_id, &fetched.manifest)
        && verify_cached_layers(&image_cache, &manifest_id, &fetched.manifest).await?;

    let parts = PartsCollector::new();
    if cache_valid {
        info!(%manifest_id, "cache valid; skipping downloads");
        for job in &jobs {
            if job.kind == LayerKind::Unknown {
                continue;
            }
            if let Some(index) = job.chunk_index {
                parts
                    .insert(index, image_cache.layer_path(&manifest_id, &job.descriptor.digest))
                    .await;
            }
            progress.add_completed_bytes(job.descriptor.size);
            progress.file_done();
        }
    } else {
        image_cache.reset(&manifest_id)?;
        image_cache.write_manifest(&manifest_id, &fetched.bytes)?;
        image_cache.write_metadata(image, &manifest_id)?;
        download_layers(
            client.clone(),
            image_cache.clone(),
            repository.clone(),
            manifest_id.clone(),
            jobs.clone(),
            opts.concurrency.unwrap_or_else(worker_count),
            progress.clone(),
            parts.clone(),
        )
        .await?;
    }

    let location = opts
        .location
        .clone()
        .unwrap_or_else(|| config.cache_root.join("vms"));
    tokio::fs::create_dir_all(&location)
        .await
        .map_err(|e| OviError::TargetDirectoryError(format!("{}: {e}", location.display())))?;
    let vm_name = opts
        .vm_name
        .clone()
        .unwrap_or_else(|| format!("{}_{}", reference.name.replace('/', "_"), reference.tag));

    // assemble in a staging directory on the destination filesystem so the
    // final move is a rename
    let staging = tempfile::Builder::new()
        .prefix(".ovi-pull-")
        .tempdir_in(&location)?;

    let parts_map = parts.take().await;
    {
        let image_cache = image_cache.clone();
        let manifest = fetched.manifest.clone();
        let manifest_id = manifest_id.clone();
        let staging_path = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            assemble_vm(&image_cache, &manifest_id, &manifest, &parts_map, &staging_path)
        })
        .await??;
    }

    let vm_dir = location.join(&vm_name);
    if vm_dir.exists() {
        tokio::fs::remove_dir_all(&vm_dir).await?;
    }
    let staged = staging.keep();
    if let Err(e) = tokio::fs::rename(&staged, &vm_dir).await {
        let _ = tokio::fs::remove_dir_all(&staged).await;
        return Err(e.into());
    }

    if let Err(e) = image_cache.gc_except(&manifest_id, image) {
        warn!(error = %e, "cache GC failed");
    }
    info!(vm_dir = %vm_dir.display(), "pull complete");
    Ok(PullOutcome {
        vm_dir,
        manifest_id,
        reused_cache: cache_valid,
    })
}

/// Drop cached manifest directories that `image` no longer points at.
pub async fn prune(config: &RegistryConfig, image: &str) -> Result<usize> {
    let reference = ImageReference::parse(image)?;
    let repository = reference.repository(&config.organization);
    let mut client = RegistryClient::new(&config.host)?;
    client.authenticate(&repository, false).await?;
    let fetched = client.fetch_manifest(&repository, &reference.tag).await?;
    let image_cache = ImageCache::open(&config.cache_root, &config.organization)?;
    image_cache.gc_except(&cache::manifest_id(&fetched.digest), image)
}

/// Layer content must hash to its digest before a cached copy is reused;
/// mismatches downgrade to a cache miss.
async fn verify_cached_layers(
    image_cache: &Arc<ImageCache>,
    manifest_id: &str,
    m: &OciManifest,
) -> Result<bool> {
    let image_cache = image_cache.clone();
    let manifest_id = manifest_id.to_string();
    let m = m.clone();
    Ok(tokio::task::spawn_blocking(move || {
        m.layers.iter().all(|layer| {
            let ok = image_cache.verify_layer(&manifest_id, &layer.digest);
            if !ok {
                warn!(digest = %layer.digest, "cached layer failed verification");
            }
            ok
        })
    })
    .await?)
}

#[allow(clippy::too_many_arguments)]
async fn download_layers(
    client: Arc<RegistryClient>,
    image_cache: Arc<ImageCache>,
    repository: String,
    manifest_id: String,
    jobs: Vec<LayerJob>,
    concurrency: usize,
    progress: Arc<TransferProgress>,
    parts: Arc<PartsCollector>,
) -> Result<()> {
    let inflight = InflightSet::new();
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for job in jobs {
        if job.kind == LayerKind::Unknown {
            warn!(media_type = %job.descriptor.media_type, "skipping layer with unknown media type");
            continue;
        }
        let client = client.clone();
        let image_cache = image_cache.clone();
        let repository = repository.clone();
        let manifest_id = manifest_id.clone();
        let progress = progress.clone();
        let parts = parts.clone();
        let inflight = inflight.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            let digest = job.descriptor.digest.clone();
            let dest = image_cache.layer_path(&manifest_id, &digest);
            if dest.is_file() {
                debug!(%digest, "layer already present");
            } else if inflight.begin(&digest).await {
                let result = client.pull_blob(&repository, &digest, &dest).await;
                inflight.finish(&digest).await;
                result?;
            } else {
                // another task owns this digest; wait for its file
                inflight.wait_for_file(&digest, &dest, DEDUP_WAIT).await?;
            }
            if let Some(index) = job.chunk_index {
                parts.insert(index, dest).await;
            }
            progress.add_completed_bytes(job.descriptor.size);
            progress.file_done();
            debug!(digest = %job.descriptor.digest, "layer cached");
            Ok(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tasks.abort_all();
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Place every layer into the staging VM directory: config and nvram by
/// fixed filename, then the disk rebuilt sparsely chunk by chunk.
fn assemble_vm(
    image_cache: &ImageCache,
    manifest_id: &str,
    m: &OciManifest,
    parts: &BTreeMap<usize, PathBuf>,
    vm_dir: &Path,
) -> Result<()> {
    let jobs = plan_layers(m);

    // config first: its diskSize is the fallback for the disk length
    for job in jobs.iter().filter(|j| j.kind == LayerKind::Config) {
        let src = image_cache.layer_path(manifest_id, &job.descriptor.digest);
        fs::copy(&src, vm_dir.join("config.json"))?;
        debug!(digest = %job.descriptor.digest, "config placed");
    }

    for job in jobs.iter().filter(|j| j.kind == LayerKind::Nvram) {
        let src_path = image_cache.layer_path(manifest_id, &job.descriptor.digest);
        let mut src = File::open(&src_path).map_err(|e| OviError::ReassemblySetupFailed {
            path: src_path.clone(),
            source: e,
        })?;
        let out_path = vm_dir.join("nvram.bin");
        let mut out =
            File::create(&out_path).map_err(|_| OviError::FileCreationFailed(out_path.clone()))?;
        // uncompressed annotations mark the blob as LZ4; plain blobs copy through
        let compressed = job.descriptor.uncompressed_size().is_some()
            || job.descriptor.uncompressed_digest().is_some();
        let codec: &dyn Compressor = if compressed { &Lz4 } else { &Store };
        codec.decompress(&mut src, &mut out)?;
        debug!(digest = %job.descriptor.digest, compressed, "nvram placed");
    }

    let chunk_count = jobs.iter().filter(|j| j.kind == LayerKind::DiskChunk).count();
    if chunk_count > 0 {
        let disk_size = disk_size_hint(m, vm_dir, chunk_count)?;
        let disk_path = vm_dir.join("disk.img");
        let mut disk =
            File::create(&disk_path).map_err(|_| OviError::FileCreationFailed(disk_path.clone()))?;
        if let Some(size) = disk_size {
            disk.set_len(size)?;
        }
        let mut offset = 0u64;
        for index in 0..chunk_count {
            let part = parts.get(&index).ok_or(OviError::MissingPart(index))?;
            let src = File::open(part).map_err(|e| OviError::ReassemblySetupFailed {
                path: part.clone(),
                source: e,
            })?;
            let mut decoder = lz4f::decoder(BufReader::new(src));
            let written = SparseWriter::new(&mut disk, offset).consume(&mut decoder)?;
            debug!(index, offset, written, "chunk placed");
            offset += written;
        }
        if disk_size.is_none() {
            disk.set_len(offset)?;
        }
        disk.sync_all()?;
    } else if let Some(job) = jobs.iter().find(|j| j.kind == LayerKind::WholeDisk) {
        let src_path = image_cache.layer_path(manifest_id, &job.descriptor.digest);
        let src = File::open(&src_path).map_err(|e| OviError::ReassemblySetupFailed {
            path: src_path.clone(),
            source: e,
        })?;
        let disk_path = vm_dir.join("disk.img");
        let mut disk =
            File::create(&disk_path).map_err(|_| OviError::FileCreationFailed(disk_path.clone()))?;
        disk.set_len(job.descriptor.size)?;
        let mut reader = BufReader::new(src);
        SparseWriter::new(&mut disk, 0).consume(&mut reader)?;
        disk.sync_all()?;
        debug!(digest = %job.descriptor.digest, "whole disk placed");
    }

    Ok(())
}

/// Image-level uncompressed disk size: the manifest annotation, then the
/// config's `diskSize`. Required once the disk spans multiple chunks.
fn disk_size_hint(m: &OciManifest, vm_dir: &Path, chunk_count: usize) -> Result<Option<u64>> {
    if let Some(size) = m.uncompressed_disk_size() {
        return Ok(Some(size));
    }
    let config_path = vm_dir.join("config.json");
    if config_path.is_file() {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&fs::read(&config_path)?) {
            if let Some(size) = value.get("diskSize").and_then(|v| v.as_u64()) {
                return Ok(Some(size));
            }
        }
    }
    if chunk_count > 1 {
        return Err(OviError::MissingUncompressedSizeAnnotation);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::manifest::{
        CONFIG_MEDIA_TYPE, DISK_CHUNK_MEDIA_TYPE, OCTET_STREAM_MEDIA_TYPE,
    };

    fn descriptor(media_type: &str, digest: &str) -> OciDescriptor {
        OciDescriptor {
            media_type: media_type.to_string(),
            size: 1,
            digest: digest.to_string(),
            annotations: None,
        }
    }

    #[test]
    fn chunk_indexes_follow_manifest_order() {
        let m = OciManifest::new(
            Some(descriptor(CONFIG_MEDIA_TYPE, "sha256:c")),
            vec![
                descriptor(OCTET_STREAM_MEDIA_TYPE, "sha256:n"),
                descriptor(DISK_CHUNK_MEDIA_TYPE, "sha256:d0"),
                descriptor("application/x-unknown", "sha256:u"),
                descriptor(DISK_CHUNK_MEDIA_TYPE, "sha256:d1"),
            ],
            Default::default(),
        );
        let jobs = plan_layers(&m);
        assert_eq!(jobs[0].chunk_index, None);
        assert_eq!(jobs[1].chunk_index, Some(0));
        assert_eq!(jobs[2].kind, LayerKind::Unknown);
        assert_eq!(jobs[3].chunk_index, Some(1));
    }

    #[test]
    fn disk_size_prefers_annotation_then_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            crate::oci::manifest::ANNOTATION_DISK_SIZE.to_string(),
            "4096".to_string(),
        );
        let annotated = OciManifest::new(None, vec![], annotations);
        assert_eq!(disk_size_hint(&annotated, dir.path(), 2).unwrap(), Some(4096));

        let bare = OciManifest::new(None, vec![], Default::default());
        std::fs::write(dir.path().join("config.json"), br#"{"diskSize": 8192}"#).unwrap();
        assert_eq!(disk_size_hint(&bare, dir.path(), 2).unwrap(), Some(8192));
    }

    #[test]
    fn multi_chunk_without_size_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bare = OciManifest::new(None, vec![], Default::default());
        assert!(matches!(
            disk_size_hint(&bare, dir.path(), 2),
            Err(OviError::MissingUncompressedSizeAnnotation)
        ));
        // a single chunk may fall back to "size of what was written"
        assert_eq!(disk_size_hint(&bare, dir.path(), 1).unwrap(), None);
    }
}
