use std::path::PathBuf;

use thiserror::Error;

use crate::hash::sha256::DigestError;

pub type Result<T> = std::result::Result<T, OviError>;

#[derive(Error, Debug)]
pub enum OviError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("task failure: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid image format `{0}`: expected name:tag")]
    InvalidImageFormat(String),

    #[error("manifest fetch failed: {0}")]
    ManifestFetchFailed(String),

    #[error("manifest push failed: {0}")]
    ManifestPushFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("registry response carried no token")]
    MissingToken,

    #[error("layer download failed: {0}")]
    LayerDownloadFailed(String),

    #[error("blob upload failed: {0}")]
    BlobUploadFailed(String),

    #[error("upload initiation failed: {0}")]
    UploadInitiationFailed(String),

    #[error("missing disk image: {0}")]
    MissingDiskImage(PathBuf),

    #[error("missing disk part {0}")]
    MissingPart(usize),

    #[error("manifest carries no uncompressed disk size")]
    MissingUncompressedSizeAnnotation,

    #[error("failed to create file {0}")]
    FileCreationFailed(PathBuf),

    #[error("reassembly setup failed at {path}: {source}")]
    ReassemblySetupFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("reassembled disk does not match its source: {0}")]
    ReassemblyMismatch(String),

    #[error("target directory error: {0}")]
    TargetDirectoryError(String),
}
