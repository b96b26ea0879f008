//! Client side of the local server's JSON API.
//!
//! Shared by the OSjs transport (one POST per verb) and the WebDAV transport
//! (the generic `curl` verb, used to route around cross-origin limits). The
//! wire types here are also what the server speaks.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::{VfsError, VfsResult};
use super::path::VirtualPath;
use super::types::{FileMetadata, UploadFile};

/// Server error text for a missing target.
pub const MSG_NOT_FOUND: &str = "No such file or directory";
/// Server error text for an occupied target.
pub const MSG_EXISTS: &str = "File or directory already exist.";
/// Server error text for an upload over the size limit.
pub const MSG_TOO_LARGE: &str = "File is too large";

/// Default API root when none is configured.
pub const DEFAULT_API_ROOT: &str = "http://localhost:8000/FS";

/// `{result, error}` response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default = "none")]
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

fn none<T>() -> Option<T> {
    None
}

impl<T> ApiResponse<T> {
    pub fn ok(result: T) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    /// Error text wins; otherwise the result, which may legitimately be null.
    pub fn into_result(self) -> VfsResult<Option<T>> {
        match self.error {
            Some(message) => Err(error_from_message(&message)),
            None => Ok(self.result),
        }
    }
}

/// Map a server error message back onto the error taxonomy.
pub fn error_from_message(message: &str) -> VfsError {
    if message.starts_with(MSG_NOT_FOUND) {
        VfsError::NotFound(message.to_string())
    } else if message.starts_with(MSG_EXISTS) {
        VfsError::Exists(message.to_string())
    } else {
        VfsError::Wire(message.to_string())
    }
}

/// Arguments of the `curl` verb: an HTTP request the server performs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Base64 request body.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = Some(STANDARD.encode(body));
        self
    }
}

/// Result of the `curl` verb.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Base64 response body.
    #[serde(default)]
    pub body: String,
}

impl FetchResponse {
    pub fn decoded_body(&self) -> VfsResult<Bytes> {
        STANDARD
            .decode(&self.body)
            .map(Bytes::from)
            .map_err(|e| VfsError::wire(format!("bad proxy body: {e}")))
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Connection settings for the local server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub api_root: String,
    /// Largest accepted upload in bytes; 0 means unlimited.
    pub max_upload_size: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            api_root: DEFAULT_API_ROOT.to_string(),
            max_upload_size: 0,
            request_timeout_secs: 30,
        }
    }
}

/// HTTP client bound to one API root.
#[derive(Debug, Clone)]
pub struct Connection {
    client: reqwest::Client,
    api_root: Url,
    max_upload_size: u64,
}

impl Connection {
    pub fn new(settings: &ConnectionSettings) -> VfsResult<Self> {
        let api_root = Url::parse(settings.api_root.trim_end_matches('/'))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(VfsError::from)?;

        Ok(Self {
            client,
            api_root,
            max_upload_size: settings.max_upload_size,
        })
    }

    pub fn api_root(&self) -> &Url {
        &self.api_root
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    fn endpoint(&self, verb: &str) -> VfsResult<Url> {
        let mut url = self.api_root.clone();
        url.path_segments_mut()
            .map_err(|_| VfsError::config(format!("api root cannot be a base: {}", self.api_root)))?
            .pop_if_empty()
            .push(verb);
        Ok(url)
    }

    /// POST `args` to `<api_root>/<verb>` and return the raw response.
    pub async fn request_raw<A: Serialize + ?Sized>(
        &self,
        verb: &str,
        args: &A,
    ) -> VfsResult<reqwest::Response> {
        let url = self.endpoint(verb)?;
        tracing::trace!(%url, "api request");
        Ok(self.client.post(url).json(args).send().await?)
    }

    /// POST `args` and unwrap the `{result, error}` envelope.
    ///
    /// A null result is `EmptyRemote`.
    pub async fn request<A, T>(&self, verb: &str, args: &A) -> VfsResult<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.request_raw(verb, args).await?;
        decode_envelope::<T>(response)
            .await?
            .ok_or_else(|| VfsError::empty_remote(verb))
    }

    /// Fail fast if `size` exceeds the upload limit.
    pub fn check_upload_size(&self, size: u64) -> VfsResult<()> {
        if self.max_upload_size > 0 && size > self.max_upload_size {
            return Err(VfsError::TooLarge {
                size,
                limit: self.max_upload_size,
            });
        }
        Ok(())
    }

    /// Multipart upload of `file` into `dir`.
    ///
    /// The size check runs before any network I/O.
    pub async fn upload(
        &self,
        dir: &VirtualPath,
        file: UploadFile,
        overwrite: bool,
    ) -> VfsResult<FileMetadata> {
        self.check_upload_size(file.blob.len() as u64)?;

        let part = Part::stream(reqwest::Body::from(file.blob.data))
            .file_name(file.filename.clone())
            .mime_str(&file.blob.mime)
            .map_err(VfsError::from)?;

        let mut form = Form::new()
            .text("path", dir.to_string())
            .text("filename", file.filename)
            .text("overwrite", overwrite.to_string());
        for (key, value) in file.fields {
            form = form.text(key, value);
        }
        form = form.part("upload", part);

        let response = self
            .client
            .post(self.endpoint("upload")?)
            .multipart(form)
            .send()
            .await?;
        decode_envelope::<FileMetadata>(response)
            .await?
            .ok_or_else(|| VfsError::empty_remote("upload"))
    }

    /// Have the server perform an HTTP request on our behalf.
    pub async fn fetch(&self, request: &FetchRequest) -> VfsResult<FetchResponse> {
        self.request("curl", request).await
    }

    /// Download URL served by `GET <api_root>/read?path=<target>`.
    pub fn read_url(&self, target: &str) -> VfsResult<String> {
        let mut url = self.endpoint("read")?;
        url.query_pairs_mut().append_pair("path", target);
        Ok(url.to_string())
    }
}

/// Decode a `{result, error}` body regardless of HTTP status.
pub async fn decode_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> VfsResult<Option<T>> {
    let status = response.status();
    let body = response.bytes().await?;
    if body.is_empty() {
        return Err(VfsError::empty_remote(format!("HTTP {status}")));
    }
    match serde_json::from_slice::<ApiResponse<T>>(&body) {
        Ok(envelope) => envelope.into_result(),
        Err(e) if status.is_success() => Err(VfsError::wire(format!("bad response: {e}"))),
        Err(_) => Err(VfsError::wire(format!("HTTP {status}"))),
    }
}
