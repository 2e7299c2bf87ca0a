use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::chunking::plan::{ChunkPlan, DEFAULT_CHUNK_SIZE_MB, plan_chunks};
use crate::codec::Compressor;
use crate::codec::lz4f::{self, Lz4};
use crate::config::RegistryConfig;
use crate::error::{OviError, Result};
use crate::hash::sha256;
use crate::oci::client::RegistryClient;
use crate::oci::manifest::{
    ANNOTATION_CREATED, ANNOTATION_DISK_SIZE, ANNOTATION_DISK_SIZE_LEGACY,
    ANNOTATION_UNCOMPRESSED_DIGEST, ANNOTATION_UNCOMPRESSED_DIGEST_LEGACY,
    ANNOTATION_UNCOMPRESSED_SIZE, ANNOTATION_UNCOMPRESSED_SIZE_LEGACY, CONFIG_MEDIA_TYPE,
    DISK_CHUNK_MEDIA_TYPE, OCTET_STREAM_MEDIA_TYPE, OciDescriptor, OciManifest,
};
use crate::sparse::writer::SparseWriter;
use crate::transfer::{InflightSet, TransferProgress, worker_count};

/// Sibling cache that lets an interrupted push resume without
/// recompressing finished chunks.
const PUSH_CACHE_DIR: &str = ".lume_push_cache";

/// How long a push task waits on another task uploading the same digest.
const UPLOAD_WAIT: Duration = Duration::from_secs(3600);

#[derive(Clone, Default)]
pub struct PushOptions {
    /// Chunk size in MiB; 512 when unset.
    pub chunk_size_mb: Option<u64>,
    /// Hash and populate the chunk cache without any registry traffic.
    pub dry_run: bool,
    /// Rebuild the disk from the cached chunks afterwards and require the
    /// digests to match.
    pub reassemble: bool,
    /// Omit the created-timestamp annotation so byte-identical inputs
    /// produce byte-identical manifests.
    pub deterministic: bool,
    /// Cap on concurrent chunk tasks; defaults to `worker_count()`.
    pub concurrency: Option<usize>,
    pub progress: Option<Arc<TransferProgress>>,
}

pub struct PushOutcome {
    pub manifest_digest: String,
    pub layers: usize,
    pub uploaded_blobs: usize,
    pub reused_blobs: usize,
}

/// `chunk_metadata.<i>.json` sidecar of a compressed `chunk.<i>`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct ChunkRecord {
    uncompressed_digest: String,
    uncompressed_size: u64,
    compressed_digest: String,
    compressed_size: u64,
}

/// Package `vm_dir` and publish it as `<org>/<image_name>` under every
/// requested tag.
pub async fn push(
    config: &RegistryConfig,
    vm_dir: &Path,
    image_name: &str,
    tags: &[String],
    opts: Option<&PushOptions>,
) -> Result<PushOutcome> {
    let default_opts = PushOptions::default();
    let opts = opts.unwrap_or(&default_opts);

    let disk_path = vm_dir.join("disk.img");
    if !disk_path.is_file() {
        return Err(OviError::MissingDiskImage(disk_path));
    }
    let config_path = vm_dir.join("config.json");
    if !config_path.is_file() {
        return Err(OviError::MissingDiskImage(config_path));
    }
    // the reconstructed name is nvram.bin, but older trees used plain nvram
    let nvram_path = ["nvram.bin", "nvram"]
        .iter()
        .map(|name| vm_dir.join(name))
        .find(|p| p.is_file());

    let repository = format!("{}/{}", config.organization, image_name);
    let client = if opts.dry_run {
        None
    } else {
        let mut c = RegistryClient::new(&config.host)?;
        c.authenticate(&repository, true).await?;
        Some(Arc::new(c))
    };

    let progress = opts.progress.clone().unwrap_or_default();
    let inflight = InflightSet::new();
    let mut uploaded = 0usize;
    let mut reused = 0usize;
    let mut layers: Vec<OciDescriptor> = Vec::new();

    // config blob: referenced by the manifest, and pushed so it is
    // retrievable on its own
    let config_bytes = tokio::fs::read(&config_path).await?;
    let config_digest = sha256::digest_bytes(&config_bytes);
    let config_descriptor = OciDescriptor {
        media_type: CONFIG_MEDIA_TYPE.to_string(),
        size: config_bytes.len() as u64,
        digest: config_digest.clone(),
        annotations: None,
    };
    progress.add_total(config_bytes.len() as u64, 1);
    if let Some(client) = &client {
        if ensure_blob(client, &repository, &config_digest, &config_bytes, &inflight).await? {
            uploaded += 1;
        } else {
            reused += 1;
        }
    }
    progress.add_completed_bytes(config_bytes.len() as u64);
    progress.file_done();

    if let Some(nvram_src) = &nvram_path {
        let raw = tokio::fs::read(nvram_src).await?;
        let raw_digest = sha256::digest_bytes(&raw);
        let mut compressed = Vec::with_capacity(raw.len() / 2 + 64);
        Lz4.compress(&mut raw.as_slice(), &mut compressed)?;
        let compressed_digest = sha256::digest_bytes(&compressed);

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_UNCOMPRESSED_SIZE.to_string(), raw.len().to_string());
        annotations.insert(
            ANNOTATION_UNCOMPRESSED_SIZE_LEGACY.to_string(),
            raw.len().to_string(),
        );
        annotations.insert(ANNOTATION_UNCOMPRESSED_DIGEST.to_string(), raw_digest.clone());
        annotations.insert(ANNOTATION_UNCOMPRESSED_DIGEST_LEGACY.to_string(), raw_digest);

        progress.add_total(compressed.len() as u64, 1);
        if let Some(client) = &client {
            if ensure_blob(client, &repository, &compressed_digest, &compressed, &inflight).await? {
                uploaded += 1;
            } else {
                reused += 1;
            }
        }
        progress.add_completed_bytes(compressed.len() as u64);
        progress.file_done();

        layers.push(OciDescriptor {
            media_type: OCTET_STREAM_MEDIA_TYPE.to_string(),
            size: compressed.len() as u64,
            digest: compressed_digest,
            annotations: Some(annotations),
        });
    }

    let disk_len = tokio::fs::metadata(&disk_path).await?.len();
    let chunk_bytes = opts.chunk_size_mb.unwrap_or(DEFAULT_CHUNK_SIZE_MB) * 1024 * 1024;
    let plans = plan_chunks(disk_len, chunk_bytes);
    let parts_dir = vm_dir.join(PUSH_CACHE_DIR).join("disk.img.parts");
    tokio::fs::create_dir_all(&parts_dir).await?;
    info!(
        image = %repository,
        chunks = plans.len(),
        disk_bytes = disk_len,
        dry_run = opts.dry_run,
        "pushing disk"
    );
    progress.add_total(0, plans.len() as u64);

    let semaphore = Arc::new(Semaphore::new(opts.concurrency.unwrap_or_else(worker_count)));
    let mut tasks: JoinSet<Result<(usize, OciDescriptor, bool)>> = JoinSet::new();
    for plan in plans.iter().copied() {
        let disk_path = disk_path.clone();
        let parts_dir = parts_dir.clone();
        let repository = repository.clone();
        let client = client.clone();
        let inflight = inflight.clone();
        let semaphore = semaphore.clone();
        let progress = progress.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            let record = prepare_chunk(&disk_path, &parts_dir, plan).await?;
            progress.add_total(record.compressed_size, 0);

            let mut did_upload = false;
            if let Some(client) = &client {
                let chunk_path = parts_dir.join(format!("chunk.{}", plan.index));
                let data = tokio::fs::read(&chunk_path).await?;
                did_upload =
                    ensure_blob(client, &repository, &record.compressed_digest, &data, &inflight)
                        .await?;
            }
            progress.add_completed_bytes(record.compressed_size);
            progress.file_done();
            Ok((plan.index, chunk_descriptor(&record), did_upload))
        });
    }

    let mut chunk_layers: Vec<(usize, OciDescriptor)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((index, descriptor, did_upload))) => {
                if client.is_some() {
                    if did_upload {
                        uploaded += 1;
                    } else {
                        reused += 1;
                    }
                }
                chunk_layers.push((index, descriptor));
            }
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
    // descriptors enter the manifest in planned order, whatever order the
    // uploads finished in
    chunk_layers.sort_by_key(|(index, _)| *index);
    layers.extend(chunk_layers.into_iter().map(|(_, descriptor)| descriptor));

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_DISK_SIZE.to_string(), disk_len.to_string());
    annotations.insert(ANNOTATION_DISK_SIZE_LEGACY.to_string(), disk_len.to_string());
    if !opts.deterministic {
        annotations.insert(
            ANNOTATION_CREATED.to_string(),
            OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?,
        );
    }
    let manifest = OciManifest::new(Some(config_descriptor), layers, annotations);
    let manifest_bytes = manifest.to_canonical_json()?;
    let manifest_digest = sha256::digest_bytes(&manifest_bytes);

    if opts.reassemble {
        verify_reassembly(&disk_path, &parts_dir, plans.len()).await?;
    }

    if let Some(client) = &client {
        for tag in tags {
            client.put_manifest(&repository, tag, &manifest_bytes).await?;
            info!(%tag, %manifest_digest, "manifest pushed");
        }
        // the chunk cache only lives for the duration of the push
        let _ = tokio::fs::remove_dir_all(vm_dir.join(PUSH_CACHE_DIR)).await;
    }

    Ok(PushOutcome {
        manifest_digest,
        layers: manifest.layers.len(),
        uploaded_blobs: uploaded,
        reused_blobs: reused,
    })
}

fn chunk_descriptor(record: &ChunkRecord) -> OciDescriptor {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_UNCOMPRESSED_SIZE.to_string(),
        record.uncompressed_size.to_string(),
    );
    annotations.insert(
        ANNOTATION_UNCOMPRESSED_SIZE_LEGACY.to_string(),
        record.uncompressed_size.to_string(),
    );
    annotations.insert(
        ANNOTATION_UNCOMPRESSED_DIGEST.to_string(),
        record.uncompressed_digest.clone(),
    );
    annotations.insert(
        ANNOTATION_UNCOMPRESSED_DIGEST_LEGACY.to_string(),
        record.uncompressed_digest.clone(),
    );
    OciDescriptor {
        media_type: DISK_CHUNK_MEDIA_TYPE.to_string(),
        size: record.compressed_size,
        digest: record.compressed_digest.clone(),
        annotations: Some(annotations),
    }
}

fn read_chunk_record(path: &Path) -> Result<ChunkRecord> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

/// Produce `chunk.<i>` and its metadata sidecar, reusing both when a
/// previous push already wrote them for the same range.
async fn prepare_chunk(disk_path: &Path, parts_dir: &Path, plan: ChunkPlan) -> Result<ChunkRecord> {
    let chunk_path = parts_dir.join(format!("chunk.{}", plan.index));
    let record_path = parts_dir.join(format!("chunk_metadata.{}.json", plan.index));

    if chunk_path.is_file() && record_path.is_file() {
        if let Ok(record) = read_chunk_record(&record_path) {
            let on_disk = tokio::fs::metadata(&chunk_path).await?.len();
            if record.uncompressed_size == plan.length && record.compressed_size == on_disk {
                debug!(index = plan.index, "reusing cached chunk");
                return Ok(record);
            }
        }
    }

    let disk_path = disk_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut disk = File::open(&disk_path)?;
        disk.seek(SeekFrom::Start(plan.offset))?;
        let mut raw = vec![0u8; plan.length as usize];
        disk.read_exact(&mut raw)?;

        let uncompressed_digest = sha256::digest_bytes(&raw);
        let mut compressed = Vec::with_capacity(raw.len() / 2 + 64);
        Lz4.compress(&mut raw.as_slice(), &mut compressed)?;
        let compressed_digest = sha256::digest_bytes(&compressed);

        let record = ChunkRecord {
            uncompressed_digest,
            uncompressed_size: plan.length,
            compressed_digest,
            compressed_size: compressed.len() as u64,
        };
        fs::write(&chunk_path, &compressed)?;
        fs::write(&record_path, serde_json::to_vec_pretty(&record)?)?;
        debug!(
            index = plan.index,
            raw = plan.length,
            compressed = record.compressed_size,
            "chunk compressed"
        );
        Ok(record)
    })
    .await?
}

/// HEAD-then-PUT with process-wide dedup: one task uploads a digest, any
/// other task wanting the same digest waits and re-probes. Returns true
/// when this call performed the upload.
async fn ensure_blob(
    client: &RegistryClient,
    repository: &str,
    digest: &str,
    data: &[u8],
    inflight: &InflightSet,
) -> Result<bool> {
    if inflight.begin(digest).await {
        let result = head_then_put(client, repository, digest, data).await;
        inflight.finish(digest).await;
        result
    } else {
        inflight.wait_until_done(digest, UPLOAD_WAIT).await;
        head_then_put(client, repository, digest, data).await
    }
}

async fn head_then_put(
    client: &RegistryClient,
    repository: &str,
    digest: &str,
    data: &[u8],
) -> Result<bool> {
    if client.blob_exists(repository, digest).await? {
        debug!(digest, "blob already on the registry");
        return Ok(false);
    }
    client.upload_blob(repository, digest, data).await?;
    Ok(true)
}

/// Decompress every cached chunk into a scratch sparse file and require
/// its digest to match the source disk.
async fn verify_reassembly(disk_path: &Path, parts_dir: &Path, chunk_count: usize) -> Result<()> {
    let disk_path = disk_path.to_path_buf();
    let parts_dir = parts_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let scratch = tempfile::tempdir()?;
        let rebuilt_path = scratch.path().join("disk.img");
        let mut rebuilt = File::create(&rebuilt_path)
            .map_err(|_| OviError::FileCreationFailed(rebuilt_path.clone()))?;
        let source_len = fs::metadata(&disk_path)?.len();
        rebuilt.set_len(source_len)?;

        let mut offset = 0u64;
        for index in 0..chunk_count {
            let part = parts_dir.join(format!("chunk.{index}"));
            if !part.is_file() {
                return Err(OviError::MissingPart(index));
            }
            let src = File::open(&part).map_err(|e| OviError::ReassemblySetupFailed {
                path: part.clone(),
                source: e,
            })?;
            let mut decoder = lz4f::decoder(BufReader::new(src));
            offset += SparseWriter::new(&mut rebuilt, offset).consume(&mut decoder)?;
        }
        rebuilt.sync_all()?;

        let rebuilt_digest = sha256::digest_file(&rebuilt_path)?;
        let source_digest = sha256::digest_file(&disk_path)?;
        if rebuilt_digest != source_digest {
            return Err(OviError::ReassemblyMismatch(format!(
                "{rebuilt_digest} != {source_digest}"
            )));
        }
        info!(bytes = offset, "reassembly verified");
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_are_cached_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.img");
        let mut payload = vec![0u8; 512 * 1024];
        payload[0] = 0x41;
        std::fs::write(&disk, &payload).unwrap();
        let parts_dir = dir.path().join("parts");
        std::fs::create_dir_all(&parts_dir).unwrap();

        let plan = ChunkPlan { index: 0, offset: 0, length: payload.len() as u64 };
        let first = prepare_chunk(&disk, &parts_dir, plan).await.unwrap();
        assert_eq!(first.uncompressed_size, payload.len() as u64);
        assert_eq!(first.uncompressed_digest, sha256::digest_bytes(&payload));

        let chunk_path = parts_dir.join("chunk.0");
        let mtime = std::fs::metadata(&chunk_path).unwrap().modified().unwrap();

        let second = prepare_chunk(&disk, &parts_dir, plan).await.unwrap();
        assert_eq!(second.compressed_digest, first.compressed_digest);
        // reuse must not rewrite the chunk
        assert_eq!(
            std::fs::metadata(&chunk_path).unwrap().modified().unwrap(),
            mtime
        );
    }

    #[tokio::test]
    async fn dry_run_reassembly_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.img");
        let mut payload = vec![0u8; 3 * 512 * 1024];
        payload[17] = 0x99;
        payload[2 * 512 * 1024] = 0x42;
        std::fs::write(&disk, &payload).unwrap();
        let parts_dir = dir.path().join("parts");
        std::fs::create_dir_all(&parts_dir).unwrap();

        let plans = plan_chunks(payload.len() as u64, 512 * 1024);
        for plan in &plans {
            prepare_chunk(&disk, &parts_dir, *plan).await.unwrap();
        }
        verify_reassembly(&disk, &parts_dir, plans.len()).await.unwrap();
    }

    #[tokio::test]
    async fn reassembly_detects_missing_parts() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.img");
        std::fs::write(&disk, vec![1u8; 1024]).unwrap();
        let parts_dir = dir.path().join("parts");
        std::fs::create_dir_all(&parts_dir).unwrap();

        let err = verify_reassembly(&disk, &parts_dir, 1).await;
        assert!(matches!(err, Err(OviError::MissingPart(0))));
    }
}
