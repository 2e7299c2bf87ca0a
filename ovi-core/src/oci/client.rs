use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{OviError, Result};
use crate::hash::sha256;
use crate::oci::manifest::{MANIFEST_MEDIA_TYPE, OciManifest};

const DIGEST_HEADER: &str = "Docker-Content-Digest";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const RESOURCE_TIMEOUT: Duration = Duration::from_secs(3600);
const BLOB_ATTEMPTS: u32 = 5;

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A manifest plus the exact bytes it was served as and its canonical
/// digest (the `Docker-Content-Digest` header when present).
pub struct FetchedManifest {
    pub manifest: OciManifest,
    pub digest: String,
    pub bytes: Vec<u8>,
}

/// Long-lived client for one registry host: token auth, manifest GET/PUT,
/// blob HEAD/POST/PUT, and retried streaming blob GET.
pub struct RegistryClient {
    http: Client,
    base: String,
    service: String,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(host: &str) -> Result<Self> {
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{host}")
        };
        let service = base
            .split("://")
            .nth(1)
            .unwrap_or(host)
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(RESOURCE_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()?;
        Ok(Self {
            http,
            base,
            service,
            token: None,
        })
    }

    /// Exchange environment credentials for a bearer token scoped to
    /// `repository`. Anonymous exchange is attempted when no credentials
    /// are set; public images work that way.
    pub async fn authenticate(&mut self, repository: &str, push: bool) -> Result<()> {
        let action = if push { "pull,push" } else { "pull" };
        let url = format!(
            "{}/token?scope=repository:{}:{}&service={}",
            self.base, repository, action, self.service
        );
        let mut req = self.http.get(&url);
        if let Some((user, token)) = credentials_from_env() {
            req = req.basic_auth(user, Some(token));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(OviError::AuthenticationFailed(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let body: TokenResponse = resp.json().await?;
        self.token = Some(body.token.or(body.access_token).ok_or(OviError::MissingToken)?);
        debug!(repository, action, "obtained registry token");
        Ok(())
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// GET the manifest for `reference` (tag or digest). The
    /// `Docker-Content-Digest` header is the canonical manifest digest;
    /// when a registry omits it the body bytes are hashed instead.
    pub async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<FetchedManifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base, repository, reference);
        let resp = self
            .authorized(self.http.get(&url))
            .header(header::ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(OviError::AuthenticationFailed(format!(
                    "manifest GET returned {}",
                    resp.status()
                )));
            }
            status => {
                return Err(OviError::ManifestFetchFailed(format!(
                    "{url} returned {status}"
                )));
            }
        }
        let header_digest = resp
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?.to_vec();
        let digest = header_digest.unwrap_or_else(|| sha256::digest_bytes(&bytes));
        let manifest: OciManifest = serde_json::from_slice(&bytes)?;
        Ok(FetchedManifest {
            manifest,
            digest,
            bytes,
        })
    }

    /// HEAD a blob; 200 means the upload can be skipped.
    pub async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/{}", self.base, repository, digest);
        let resp = self.authorized(self.http.head(&url)).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                OviError::AuthenticationFailed(format!("blob HEAD returned {}", resp.status())),
            ),
            status => Err(OviError::BlobUploadFailed(format!(
                "HEAD {digest} returned {status}"
            ))),
        }
    }

    /// Download a blob to `dest` with up to five attempts and jittered
    /// exponential backoff. The content is verified against `digest`
    /// before the file is moved into place; the return value is the blob's
    /// byte count.
    pub async fn pull_blob(&self, repository: &str, digest: &str, dest: &Path) -> Result<u64> {
        for attempt in 1..=BLOB_ATTEMPTS {
            match self.pull_blob_once(repository, digest, dest).await {
                Ok(written) => return Ok(written),
                Err(e @ OviError::AuthenticationFailed(_)) => return Err(e),
                Err(e) => {
                    warn!(digest, attempt, error = %e, "blob download attempt failed");
                    if attempt < BLOB_ATTEMPTS {
                        let backoff =
                            Duration::from_secs_f64(f64::from(attempt) * 2.0 + fastrand::f64());
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(OviError::LayerDownloadFailed(digest.to_string()))
    }

    async fn pull_blob_once(&self, repository: &str, digest: &str, dest: &Path) -> Result<u64> {
        let url = format!("{}/v2/{}/blobs/{}", self.base, repository, digest);
        let resp = self.authorized(self.http.get(&url)).send().await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(OviError::AuthenticationFailed(format!(
                    "blob GET returned {}",
                    resp.status()
                )));
            }
            status => {
                return Err(OviError::LayerDownloadFailed(format!(
                    "{digest}: status {status}"
                )));
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            hasher.update(&frame);
            file.write_all(&frame).await?;
            written += frame.len() as u64;
        }
        file.flush().await?;
        drop(file);

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != digest {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(OviError::LayerDownloadFailed(format!(
                "{digest}: content hashed to {actual}"
            )));
        }
        tokio::fs::rename(&partial, dest).await?;
        debug!(digest, bytes = written, "blob downloaded");
        Ok(written)
    }

    /// Upload a blob through an upload session (POST for the session,
    /// PUT with the digest to commit), retrying like downloads do.
    pub async fn upload_blob(&self, repository: &str, digest: &str, data: &[u8]) -> Result<()> {
        for attempt in 1..=BLOB_ATTEMPTS {
            match self.upload_blob_once(repository, digest, data).await {
                Ok(()) => return Ok(()),
                Err(e @ OviError::AuthenticationFailed(_)) => return Err(e),
                Err(e) => {
                    warn!(digest, attempt, error = %e, "blob upload attempt failed");
                    if attempt < BLOB_ATTEMPTS {
                        let backoff =
                            Duration::from_secs_f64(f64::from(attempt) * 2.0 + fastrand::f64());
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(OviError::BlobUploadFailed(format!(
            "{digest}: retries exhausted"
        )))
    }

    async fn upload_blob_once(&self, repository: &str, digest: &str, data: &[u8]) -> Result<()> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.base, repository);
        let resp = self
            .authorized(self.http.post(&url))
            .header(header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        match resp.status() {
            StatusCode::ACCEPTED => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(OviError::AuthenticationFailed(format!(
                    "upload POST returned {}",
                    resp.status()
                )));
            }
            status => {
                return Err(OviError::UploadInitiationFailed(format!(
                    "{url} returned {status}"
                )));
            }
        }
        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                OviError::UploadInitiationFailed("upload session carried no Location".to_string())
            })?;
        let upload_url = self.resolve_location(location);
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let commit_url = format!("{upload_url}{separator}digest={digest}");

        let resp = self
            .authorized(self.http.put(&commit_url))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, data.len())
            .body(data.to_vec())
            .send()
            .await?;
        match resp.status() {
            StatusCode::CREATED => {
                debug!(digest, bytes = data.len(), "blob uploaded");
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                OviError::AuthenticationFailed(format!("blob PUT returned {}", resp.status())),
            ),
            status => Err(OviError::BlobUploadFailed(format!(
                "{digest}: status {status}"
            ))),
        }
    }

    /// PUT manifest bytes under a tag.
    pub async fn put_manifest(&self, repository: &str, tag: &str, bytes: &[u8]) -> Result<()> {
        let url = format!("{}/v2/{}/manifests/{}", self.base, repository, tag);
        let resp = self
            .authorized(self.http.put(&url))
            .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
            .body(bytes.to_vec())
            .send()
            .await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                OviError::AuthenticationFailed(format!("manifest PUT returned {}", resp.status())),
            ),
            status => Err(OviError::ManifestPushFailed(format!(
                "{url} returned {status}"
            ))),
        }
    }

    /// Upload sessions may hand back an absolute URL or a path relative to
    /// the registry host.
    fn resolve_location(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else if location.starts_with('/') {
            format!("{}{}", self.base, location)
        } else {
            format!("{}/{}", self.base, location)
        }
    }
}

fn credentials_from_env() -> Option<(String, String)> {
    let user = std::env::var("GITHUB_USERNAME")
        .or_else(|_| std::env::var("GHCR_USERNAME"))
        .ok();
    let token = std::env::var("GITHUB_TOKEN")
        .or_else(|_| std::env::var("GHCR_TOKEN"))
        .ok()?;
    Some((user.unwrap_or_default(), token))
}
