//! HTTP JSON API.
//!
//! One `POST <api_root>/<verb>` per VFS verb, answered with the
//! `{result, error}` envelope, plus `GET <api_root>/read?path=` for download
//! URLs. Every verb runs through a [`Dispatcher`] over the served mounts.

use std::collections::BTreeMap;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use kumo_vfs::vfs::connection::{
    ApiResponse, FetchRequest, FetchResponse, MSG_EXISTS, MSG_NOT_FOUND, MSG_TOO_LARGE,
};
use kumo_vfs::vfs::{FindQuery, ScandirOptions, TransferOptions, UploadFile, guess_mime};
use kumo_vfs::{Dispatcher, FileBlob, FileMetadata, VfsError, VirtualPath};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    vfs: Dispatcher,
    http: reqwest::Client,
    /// 0 means unlimited.
    max_upload_size: u64,
}

impl AppState {
    pub fn new(vfs: Dispatcher, max_upload_size: u64) -> Self {
        Self {
            vfs,
            http: reqwest::Client::new(),
            max_upload_size,
        }
    }

    pub fn vfs(&self) -> &Dispatcher {
        &self.vfs
    }
}

/// Build the API router, nested under `api_root` (e.g. `/FS`).
pub fn router(state: AppState, api_root: &str) -> Router {
    let api = Router::new()
        .route("/scandir", post(scandir))
        .route("/read", post(read).get(read_url))
        .route("/upload", post(upload))
        .route("/unlink", post(unlink))
        .route("/copy", post(copy))
        .route("/move", post(rename))
        .route("/mkdir", post(mkdir))
        .route("/exists", post(exists))
        .route("/fileinfo", post(fileinfo))
        .route("/find", post(find))
        .route("/freeSpace", post(free_space))
        .route("/curl", post(curl))
        .route("/mounts", get(mounts))
        // Uploads are bounded by `max_upload_size` instead.
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    let root = api_root.trim_end_matches('/');
    if root.is_empty() {
        api
    } else {
        Router::new().nest(root, api)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Vfs(#[from] VfsError),

    #[error("malformed upload: {0}")]
    Multipart(#[from] MultipartError),

    #[error("upload is missing the `{0}` field")]
    MissingField(&'static str),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Vfs(e) => match e {
                VfsError::NotFound(_) => StatusCode::NOT_FOUND,
                VfsError::Exists(_) => StatusCode::CONFLICT,
                VfsError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                VfsError::ReadOnly(_) | VfsError::PathEscapesRoot(_) => StatusCode::FORBIDDEN,
                VfsError::InvalidPath(_) | VfsError::NoMount(_) => StatusCode::BAD_REQUEST,
                VfsError::Unavailable(_) => StatusCode::NOT_IMPLEMENTED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Multipart(_) | Self::MissingField(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Client-facing text. Missing and occupied targets use fixed prefixes
    /// the client maps back onto `NotFound` and `Exists`.
    fn message(&self) -> String {
        match self {
            Self::Vfs(VfsError::NotFound(detail)) => format!("{MSG_NOT_FOUND}: {detail}"),
            Self::Vfs(VfsError::Exists(detail)) => format!("{MSG_EXISTS} ({detail})"),
            Self::Vfs(VfsError::TooLarge { size, limit }) => {
                format!("{MSG_TOO_LARGE}: {size} > {limit} bytes")
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        (status, Json(ApiResponse::<()>::err(self.message()))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(result: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(result)))
}

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: VirtualPath,
}

#[derive(Debug, Deserialize)]
struct TransferArgs {
    src: VirtualPath,
    dest: VirtualPath,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, Deserialize)]
struct FindArgs {
    path: VirtualPath,
    args: FindQuery,
}

#[derive(Debug, Deserialize)]
struct RootArgs {
    root: VirtualPath,
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    path: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn scandir(
    State(state): State<AppState>,
    Json(args): Json<PathArgs>,
) -> ApiResult<Vec<FileMetadata>> {
    ok(state.vfs.scandir(&args.path, &ScandirOptions::raw()).await?)
}

fn blob_response(blob: FileBlob) -> Response {
    ([(header::CONTENT_TYPE, blob.mime)], blob.data).into_response()
}

async fn read(
    State(state): State<AppState>,
    Json(args): Json<PathArgs>,
) -> Result<Response, ApiError> {
    Ok(blob_response(state.vfs.read(&args.path).await?))
}

/// `GET read?path=`: a virtual path is served from the mounts; an http(s)
/// URL is fetched and relayed.
async fn read_url(
    State(state): State<AppState>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    if query.path.starts_with("http://") || query.path.starts_with("https://") {
        let response = state
            .http
            .get(&query.path)
            .send()
            .await
            .map_err(VfsError::from)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(VfsError::not_found(query.path).into());
        }
        if !status.is_success() {
            return Err(VfsError::wire(format!("upstream returned HTTP {status}")).into());
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response.bytes().await.map_err(VfsError::from)?;
        let blob = match mime {
            Some(mime) => FileBlob::new(data, mime),
            None => FileBlob::guessed(data, query.path.rsplit('/').next().unwrap_or_default()),
        };
        return Ok(blob_response(blob));
    }

    let path = VirtualPath::parse(&query.path)?;
    Ok(blob_response(state.vfs.read(&path).await?))
}

/// Multipart fields: `path` (target directory), `filename`, `overwrite`,
/// and the `upload` file part. Other fields are ignored.
async fn upload(State(state): State<AppState>, mut form: Multipart) -> ApiResult<FileMetadata> {
    let mut dir = None;
    let mut filename = None;
    let mut overwrite = false;
    let mut file: Option<(Option<String>, Option<String>, Bytes)> = None;

    while let Some(field) = form.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "path" => dir = Some(field.text().await?),
            "filename" => filename = Some(field.text().await?),
            "overwrite" => overwrite = field.text().await?.trim() == "true",
            "upload" => {
                let part_name = field.file_name().map(str::to_string);
                let mime = field.content_type().map(str::to_string);
                let data = field.bytes().await?;
                file = Some((part_name, mime, data));
            }
            other => tracing::trace!(field = other, "ignoring upload field"),
        }
    }

    let dir = VirtualPath::parse(&dir.ok_or(ApiError::MissingField("path"))?)?;
    let (part_name, mime, data) = file.ok_or(ApiError::MissingField("upload"))?;
    let filename = filename
        .or(part_name)
        .ok_or(ApiError::MissingField("filename"))?;

    let size = data.len() as u64;
    if state.max_upload_size > 0 && size > state.max_upload_size {
        return Err(VfsError::TooLarge {
            size,
            limit: state.max_upload_size,
        }
        .into());
    }

    let mime = mime.unwrap_or_else(|| guess_mime(&filename));
    let file = UploadFile::new(filename, FileBlob::new(data, mime));
    ok(state.vfs.upload(&dir, file, TransferOptions { overwrite }).await?)
}

async fn unlink(State(state): State<AppState>, Json(args): Json<PathArgs>) -> ApiResult<bool> {
    state.vfs.unlink(&args.path).await?;
    ok(true)
}

async fn copy(State(state): State<AppState>, Json(args): Json<TransferArgs>) -> ApiResult<bool> {
    let opts = TransferOptions {
        overwrite: args.overwrite,
    };
    state.vfs.copy(&args.src, &args.dest, opts).await?;
    ok(true)
}

async fn rename(State(state): State<AppState>, Json(args): Json<TransferArgs>) -> ApiResult<bool> {
    let opts = TransferOptions {
        overwrite: args.overwrite,
    };
    state.vfs.rename(&args.src, &args.dest, opts).await?;
    ok(true)
}

async fn mkdir(State(state): State<AppState>, Json(args): Json<PathArgs>) -> ApiResult<bool> {
    state.vfs.mkdir(&args.path, TransferOptions::default()).await?;
    ok(true)
}

async fn exists(State(state): State<AppState>, Json(args): Json<PathArgs>) -> ApiResult<bool> {
    ok(state.vfs.exists(&args.path).await?)
}

async fn fileinfo(
    State(state): State<AppState>,
    Json(args): Json<PathArgs>,
) -> ApiResult<FileMetadata> {
    ok(state.vfs.fileinfo(&args.path).await?)
}

async fn find(
    State(state): State<AppState>,
    Json(args): Json<FindArgs>,
) -> ApiResult<Vec<FileMetadata>> {
    ok(state.vfs.find(&args.path, &args.args).await?)
}

async fn free_space(State(state): State<AppState>, Json(args): Json<RootArgs>) -> ApiResult<i64> {
    ok(state.vfs.free_space(&args.root).await?)
}

async fn mounts(State(state): State<AppState>) -> ApiResult<Vec<kumo_vfs::MountInfo>> {
    ok(state.vfs.snapshot())
}

/// Perform an HTTP request on the caller's behalf and relay the response.
async fn curl(
    State(state): State<AppState>,
    Json(request): Json<FetchRequest>,
) -> ApiResult<FetchResponse> {
    let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| VfsError::wire(format!("bad method: {}", request.method)))?;

    let mut builder = state.http.request(method, &request.url);
    for (key, value) in &request.headers {
        builder = builder.header(key, value);
    }
    if let Some(body) = &request.body {
        let body = STANDARD
            .decode(body)
            .map_err(|e| VfsError::wire(format!("bad request body: {e}")))?;
        builder = builder.body(body);
    }

    tracing::debug!(url = %request.url, method = %request.method, "proxying request");
    let response = builder.send().await.map_err(VfsError::from)?;
    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let body = response.bytes().await.map_err(VfsError::from)?;

    ok(FetchResponse {
        status,
        headers,
        body: STANDARD.encode(&body),
    })
}
