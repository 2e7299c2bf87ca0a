//! In-process OCI registry for transfer tests. Every request bumps a
//! counter keyed by method and target, so dedup, retry-bound, and
//! cache-reuse properties are observable from the outside.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};

use ovi_core::hash::sha256::digest_bytes;

#[derive(Default)]
pub struct RegistryState {
    pub blobs: HashMap<String, Vec<u8>>,
    /// reference (tag or digest) -> (digest, manifest bytes)
    pub manifests: HashMap<String, (String, Vec<u8>)>,
    /// "<METHOD> <target>" -> hits
    pub counters: HashMap<String, usize>,
    pub fail_token: bool,
    /// digests whose GET always returns 500
    pub fail_blobs: Vec<String>,
    next_upload: usize,
}

pub type Shared = Arc<Mutex<RegistryState>>;

pub struct MockRegistry {
    pub addr: SocketAddr,
    pub state: Shared,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/token", get(token))
            .route(
                "/v2/{org}/{name}/manifests/{reference}",
                get(get_manifest).put(put_manifest),
            )
            .route("/v2/{org}/{name}/blobs/{digest}", get(blob))
            .route("/v2/{org}/{name}/blobs/uploads/", post(start_upload))
            .route("/v2/{org}/{name}/uploads/{id}", put(finish_upload))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn host(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn count(&self, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .counters
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Sum of counters whose key starts with `prefix`.
    pub fn count_matching(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .counters
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v)
            .sum()
    }

    /// Store a blob and return its digest.
    pub fn add_blob(&self, bytes: &[u8]) -> String {
        let digest = digest_bytes(bytes);
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(digest.clone(), bytes.to_vec());
        digest
    }

    /// Register manifest bytes under a tag (and its digest); returns the
    /// manifest digest.
    pub fn set_manifest(&self, tag: &str, bytes: &[u8]) -> String {
        let digest = digest_bytes(bytes);
        let mut s = self.state.lock().unwrap();
        s.manifests
            .insert(tag.to_string(), (digest.clone(), bytes.to_vec()));
        s.manifests
            .insert(digest.clone(), (digest.clone(), bytes.to_vec()));
        digest
    }

    pub fn manifest_bytes(&self, reference: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(reference)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn set_fail_token(&self, fail: bool) {
        self.state.lock().unwrap().fail_token = fail;
    }

    pub fn fail_blob(&self, digest: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_blobs
            .push(digest.to_string());
    }
}

async fn token(State(state): State<Shared>) -> Response {
    let mut s = state.lock().unwrap();
    *s.counters.entry("GET token".to_string()).or_default() += 1;
    if s.fail_token {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"token":"test-token"}"#,
    )
        .into_response()
}

async fn get_manifest(
    State(state): State<Shared>,
    method: Method,
    Path((_org, _name, reference)): Path<(String, String, String)>,
) -> Response {
    let mut s = state.lock().unwrap();
    *s.counters
        .entry(format!("{method} manifest {reference}"))
        .or_default() += 1;
    match s.manifests.get(&reference) {
        Some((digest, bytes)) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                "application/vnd.oci.image.manifest.v1+json".parse().unwrap(),
            );
            headers.insert("docker-content-digest", digest.parse().unwrap());
            (StatusCode::OK, headers, bytes.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_manifest(
    State(state): State<Shared>,
    Path((_org, _name, reference)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    let digest = digest_bytes(&body);
    let mut s = state.lock().unwrap();
    *s.counters
        .entry(format!("PUT manifest {reference}"))
        .or_default() += 1;
    s.manifests
        .insert(reference, (digest.clone(), body.to_vec()));
    s.manifests
        .insert(digest.clone(), (digest, body.to_vec()));
    StatusCode::CREATED.into_response()
}

async fn blob(
    State(state): State<Shared>,
    method: Method,
    Path((_org, _name, digest)): Path<(String, String, String)>,
) -> Response {
    let mut s = state.lock().unwrap();
    *s.counters.entry(format!("{method} {digest}")).or_default() += 1;
    if s.fail_blobs.contains(&digest) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match s.blobs.get(&digest) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_upload(
    State(state): State<Shared>,
    Path((org, name)): Path<(String, String)>,
) -> Response {
    let mut s = state.lock().unwrap();
    *s.counters.entry("POST upload".to_string()).or_default() += 1;
    let id = s.next_upload;
    s.next_upload += 1;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        format!("/v2/{org}/{name}/uploads/{id}").parse().unwrap(),
    );
    (StatusCode::ACCEPTED, headers).into_response()
}

async fn finish_upload(
    State(state): State<Shared>,
    Path((_org, _name, _id)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(digest) = params.get("digest").cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if digest_bytes(&body) != digest {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let mut s = state.lock().unwrap();
    *s.counters.entry(format!("PUT {digest}")).or_default() += 1;
    s.blobs.insert(digest, body.to_vec());
    StatusCode::CREATED.into_response()
}
