//! Dropbox transport.
//!
//! Talks to the Dropbox v2 HTTP API. The client is loaded once (memoized
//! across concurrent callers) when the mount point is readied; the OAuth
//! session is established lazily by the first verb that needs it, through
//! the shared [`Session`] flow.
//!
//! Error mapping:
//! - 401 with `expired_access_token` drops the session and yields
//!   `AuthExpired`; any other 401 is `AuthRequired`.
//! - 409 summaries containing `not_found` / `conflict` become `NotFound` /
//!   `Exists`.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::auth::{Authorizer, Credential, DEFAULT_AUTH_TIMEOUT, Session};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::VirtualPath;
use crate::vfs::transport::Transport;
use crate::vfs::types::{FileBlob, FileMetadata, FindQuery, UploadFile, UrlOptions, guess_mime};

/// Search results are capped at this many entries.
pub const MAX_RESULTS: usize = 100;

pub const DEFAULT_API_BASE: &str = "https://api.dropboxapi.com";
pub const DEFAULT_CONTENT_BASE: &str = "https://content.dropboxapi.com";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";

/// Dropbox application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DropboxSettings {
    /// App key. Without one the transport is disabled.
    pub client_key: Option<String>,
    pub redirect_uri: String,
    pub auth_timeout_secs: u64,
    pub api_base: String,
    pub content_base: String,
    pub authorize_url: String,
}

impl Default for DropboxSettings {
    fn default() -> Self {
        Self {
            client_key: None,
            redirect_uri: "http://localhost:8000/dropbox-oauth.html".to_string(),
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT.as_secs(),
            api_base: DEFAULT_API_BASE.to_string(),
            content_base: DEFAULT_CONTENT_BASE.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
        }
    }
}

impl DropboxSettings {
    /// The implicit-grant authorization URL.
    pub fn auth_url(&self, client_key: &str) -> VfsResult<Url> {
        let mut url = Url::parse(&self.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("response_type", "token")
            .append_pair("client_id", client_key)
            .append_pair("redirect_uri", &self.redirect_uri);
        Ok(url)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum Metadata {
    File {
        name: String,
        #[serde(default)]
        path_display: Option<String>,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        size: u64,
    },
    Folder {
        name: String,
        #[serde(default)]
        path_display: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
    Deleted {},
}

impl Metadata {
    /// Normalize into a FileMetadata under `scheme`. Deleted entries and
    /// entries without a usable path are dropped.
    fn into_file(self, scheme: &str, parent: Option<&VirtualPath>) -> Option<FileMetadata> {
        let locate = |display: Option<String>, name: &str| match (display, parent) {
            (Some(p), _) => VirtualPath::from_native(scheme, &p).ok(),
            (None, Some(dir)) => dir.join(name).ok(),
            (None, None) => None,
        };

        match self {
            Metadata::File {
                name,
                path_display,
                id,
                size,
            } => {
                let path = locate(path_display, &name)?;
                let mime = guess_mime(&name);
                Some(FileMetadata::file(path, size, Some(mime)).with_id(id))
            }
            Metadata::Folder {
                name,
                path_display,
                id,
            } => {
                let path = locate(path_display, &name)?;
                Some(FileMetadata::dir(path).with_id(id))
            }
            Metadata::Deleted {} => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolder {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Search {
    matches: Vec<SearchMatch>,
}

#[derive(Debug, Deserialize)]
struct SearchMatch {
    metadata: SearchMetadata,
}

#[derive(Debug, Deserialize)]
struct SearchMetadata {
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct SharedLinks {
    links: Vec<SharedLink>,
}

#[derive(Debug, Deserialize)]
struct SharedLink {
    url: String,
    #[serde(default)]
    link_permissions: Option<LinkPermissions>,
    /// Older responses carry visibility at the top level.
    #[serde(default)]
    visibility: Option<Tag>,
}

#[derive(Debug, Deserialize)]
struct LinkPermissions {
    #[serde(default)]
    resolved_visibility: Option<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    #[serde(rename = ".tag")]
    tag: String,
}

impl SharedLink {
    fn is_public(&self) -> bool {
        self.link_permissions
            .as_ref()
            .and_then(|p| p.resolved_visibility.as_ref())
            .or(self.visibility.as_ref())
            .is_some_and(|v| v.tag == "public")
    }
}

/// A shared link, and whether it existed before this call.
enum Link {
    Existing(String),
    Created(String),
}

#[derive(Debug, Deserialize)]
struct SpaceUsage {
    used: u64,
    allocation: Allocation,
}

#[derive(Debug, Deserialize)]
struct Allocation {
    #[serde(default)]
    allocated: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
}

// ============================================================================
// Transport
// ============================================================================

pub struct DropboxTransport {
    settings: DropboxSettings,
    session: Option<Session>,
    /// Loaded client; `None` until the first `ready`/verb, and after teardown.
    client: tokio::sync::Mutex<Option<reqwest::Client>>,
}

impl DropboxTransport {
    pub fn new(settings: DropboxSettings, authorizer: Arc<dyn Authorizer>) -> VfsResult<Self> {
        let session = match settings.client_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Some(Session::new(
                authorizer,
                settings.auth_url(key)?,
                Duration::from_secs(settings.auth_timeout_secs),
            )),
            None => None,
        };

        Ok(Self {
            settings,
            session,
            client: tokio::sync::Mutex::new(None),
        })
    }

    pub fn session(&self) -> VfsResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| VfsError::AuthRequired("dropbox client key is not configured".into()))
    }

    /// Load the HTTP client once. Concurrent callers wait on the same load.
    async fn load(&self) -> VfsResult<reqwest::Client> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        self.session()?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("kumo/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(VfsError::from)?;
        tracing::debug!("dropbox client loaded");
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn authorized(&self) -> VfsResult<(reqwest::Client, Credential)> {
        let client = self.load().await?;
        let credential = self.session()?.credential().await?;
        Ok((client, credential))
    }

    fn endpoint(base: &str, endpoint: &str) -> String {
        format!("{}/2/{}", base.trim_end_matches('/'), endpoint)
    }

    /// JSON-in, JSON-out call against the API host.
    async fn rpc<T: DeserializeOwned>(&self, endpoint: &str, args: Option<Value>) -> VfsResult<T> {
        let (client, credential) = self.authorized().await?;
        let mut request = client
            .post(Self::endpoint(&self.settings.api_base, endpoint))
            .bearer_auth(credential.access_token());
        if let Some(args) = &args {
            request = request.json(args);
        }

        let response = self.check(request.send().await?, &credential).await?;
        response
            .json()
            .await
            .map_err(|e| VfsError::wire(format!("{endpoint}: {e}")))
    }

    /// Call against the content host; arguments travel in a header.
    async fn content(
        &self,
        endpoint: &str,
        args: &Value,
        body: Option<Bytes>,
    ) -> VfsResult<reqwest::Response> {
        let (client, credential) = self.authorized().await?;
        let mut request = client
            .post(Self::endpoint(&self.settings.content_base, endpoint))
            .bearer_auth(credential.access_token())
            .header("Dropbox-API-Arg", header_safe_json(args));
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body);
        }

        self.check(request.send().await?, &credential).await
    }

    /// Map non-success statuses onto the error taxonomy.
    async fn check(
        &self,
        response: reqwest::Response,
        credential: &Credential,
    ) -> VfsResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let summary = serde_json::from_str::<ApiError>(&text)
            .map(|e| e.error_summary)
            .unwrap_or_else(|_| text.clone());

        match status {
            StatusCode::UNAUTHORIZED if text.contains("expired_access_token") => {
                if let Some(session) = &self.session {
                    session.invalidate(credential);
                }
                Err(VfsError::AuthExpired)
            }
            StatusCode::UNAUTHORIZED => Err(VfsError::AuthRequired(summary)),
            StatusCode::CONFLICT if summary.contains("not_found") => {
                Err(VfsError::NotFound(summary))
            }
            StatusCode::CONFLICT if summary.contains("conflict") => Err(VfsError::Exists(summary)),
            _ => Err(VfsError::wire(format!("HTTP {status}: {summary}"))),
        }
    }

    async fn put(&self, file: &VirtualPath, blob: FileBlob) -> VfsResult<FileMetadata> {
        let args = json!({
            "path": dropbox_path(file),
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });
        let response = self.content("files/upload", &args, Some(blob.data)).await?;
        let metadata: Value = response.json().await?;
        // Upload responses are untagged file metadata.
        let entry = serde_json::from_value::<Metadata>(with_tag(metadata, "file"))
            .map_err(|e| VfsError::wire(format!("files/upload: {e}")))?;
        entry
            .into_file(file.scheme(), Some(&file.parent()))
            .ok_or_else(|| VfsError::empty_remote("files/upload"))
    }

    /// Reuse the file's public link if it has one, otherwise create one.
    /// Team-only and password-protected links are never handed out.
    async fn shared_link(&self, file: &VirtualPath) -> VfsResult<Link> {
        let existing: SharedLinks = self
            .rpc(
                "sharing/list_shared_links",
                Some(json!({ "path": dropbox_path(file), "direct_only": true })),
            )
            .await?;
        if let Some(link) = existing.links.into_iter().find(SharedLink::is_public) {
            return Ok(Link::Existing(link.url));
        }

        let created: SharedLink = self
            .rpc(
                "sharing/create_shared_link_with_settings",
                Some(json!({
                    "path": dropbox_path(file),
                    "settings": { "requested_visibility": "public" },
                })),
            )
            .await?;
        Ok(Link::Created(created.url))
    }
}

#[async_trait]
impl Transport for DropboxTransport {
    fn kind(&self) -> &'static str {
        "dropbox"
    }

    fn enabled(&self) -> bool {
        self.session.is_some()
    }

    async fn ready(&self) -> VfsResult<()> {
        self.load().await.map(|_| ())
    }

    async fn teardown(&self) {
        *self.client.lock().await = None;
        if let Some(session) = &self.session {
            session.clear();
        }
    }

    async fn sign_out(&self) -> VfsResult<()> {
        let credential = self.session.as_ref().and_then(Session::clear);
        if let Some(credential) = credential {
            let revoke = async {
                let client = self.load().await?;
                let response = client
                    .post(Self::endpoint(&self.settings.api_base, "auth/token/revoke"))
                    .bearer_auth(credential.access_token())
                    .send()
                    .await?;
                self.check(response, &credential).await.map(|_| ())
            };
            if let Err(e) = revoke.await {
                tracing::warn!(error = %e, "dropbox token revoke failed");
            }
        }
        self.teardown().await;
        tracing::info!("signed out of dropbox");
        Ok(())
    }

    async fn scandir(&self, dir: &VirtualPath) -> VfsResult<Vec<FileMetadata>> {
        let mut page: ListFolder = self
            .rpc(
                "files/list_folder",
                Some(json!({ "path": dropbox_path(dir) })),
            )
            .await?;

        let mut entries = Vec::new();
        loop {
            entries.extend(
                page.entries
                    .into_iter()
                    .filter_map(|m| m.into_file(dir.scheme(), Some(dir))),
            );
            if !page.has_more {
                break;
            }
            page = self
                .rpc(
                    "files/list_folder/continue",
                    Some(json!({ "cursor": page.cursor })),
                )
                .await?;
        }

        tracing::debug!(dir = %dir, count = entries.len(), "dropbox listing drained");
        Ok(entries)
    }

    async fn read(&self, file: &VirtualPath) -> VfsResult<FileBlob> {
        let response = self
            .content("files/download", &json!({ "path": dropbox_path(file) }), None)
            .await?;
        let data = response.bytes().await?;
        Ok(FileBlob::guessed(data, file.filename()))
    }

    async fn fileinfo(&self, file: &VirtualPath) -> VfsResult<FileMetadata> {
        if file.is_root() {
            return Ok(FileMetadata::dir(file.clone()));
        }
        let metadata: Metadata = self
            .rpc(
                "files/get_metadata",
                Some(json!({ "path": dropbox_path(file) })),
            )
            .await?;
        metadata
            .into_file(file.scheme(), Some(&file.parent()))
            .ok_or_else(|| VfsError::not_found(file.to_string()))
    }

    async fn find(&self, dir: &VirtualPath, query: &FindQuery) -> VfsResult<Vec<FileMetadata>> {
        let limit = query.limit.unwrap_or(MAX_RESULTS).min(MAX_RESULTS);
        let result: Search = self
            .rpc(
                "files/search_v2",
                Some(json!({
                    "query": query.query,
                    "options": { "path": dropbox_path(dir), "max_results": limit },
                })),
            )
            .await?;

        Ok(result
            .matches
            .into_iter()
            .filter_map(|m| m.metadata.metadata.into_file(dir.scheme(), None))
            .take(limit)
            .collect())
    }

    async fn url(&self, file: &VirtualPath, opts: &UrlOptions) -> VfsResult<String> {
        Ok(match self.shared_link(file).await? {
            // Reused links default to a direct download.
            Link::Existing(link) => match opts.dl.unwrap_or(1) {
                0 => link,
                dl => rewrite_dl(&link, dl),
            },
            Link::Created(link) => link,
        })
    }

    async fn free_space(&self, _root: &VirtualPath) -> i64 {
        match self.rpc::<SpaceUsage>("users/get_space_usage", None).await {
            Ok(usage) => usage.allocation.allocated.saturating_sub(usage.used) as i64,
            Err(e) => {
                tracing::warn!(error = %e, "dropbox space usage lookup failed");
                -1
            }
        }
    }

    async fn write(&self, file: &VirtualPath, blob: FileBlob) -> VfsResult<()> {
        self.put(file, blob).await.map(|_| ())
    }

    async fn copy(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        self.rpc::<Value>(
            "files/copy_v2",
            Some(json!({ "from_path": dropbox_path(src), "to_path": dropbox_path(dst) })),
        )
        .await
        .map(|_| ())
    }

    async fn rename(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        self.rpc::<Value>(
            "files/move_v2",
            Some(json!({ "from_path": dropbox_path(src), "to_path": dropbox_path(dst) })),
        )
        .await
        .map(|_| ())
    }

    async fn unlink(&self, file: &VirtualPath) -> VfsResult<()> {
        self.rpc::<Value>("files/delete_v2", Some(json!({ "path": dropbox_path(file) })))
            .await
            .map(|_| ())
    }

    async fn mkdir(&self, dir: &VirtualPath) -> VfsResult<()> {
        self.rpc::<Value>(
            "files/create_folder_v2",
            Some(json!({ "path": dropbox_path(dir), "autorename": false })),
        )
        .await
        .map(|_| ())
    }

    async fn upload(&self, dir: &VirtualPath, file: UploadFile) -> VfsResult<FileMetadata> {
        let target = dir.child(&file.filename)?;
        self.put(&target, file.blob).await
    }
}

/// Dropbox addresses its root as the empty string.
fn dropbox_path(path: &VirtualPath) -> String {
    if path.is_root() {
        String::new()
    } else {
        path.native()
    }
}

fn with_tag(mut value: Value, tag: &str) -> Value {
    if let Value::Object(map) = &mut value {
        map.entry(".tag").or_insert_with(|| Value::String(tag.to_string()));
    }
    value
}

/// Serialize `value` as JSON that is safe to carry in an HTTP header:
/// everything outside printable ASCII is `\u`-escaped.
fn header_safe_json(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    let mut units = [0u16; 2];
    for c in raw.chars() {
        if c.is_ascii() && !c.is_ascii_control() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units).iter() {
                let _ = write!(out, "\\u{unit:04x}");
            }
        }
    }
    out
}

/// Replace the `dl` query parameter of a shared link.
fn rewrite_dl(link: &str, dl: u8) -> String {
    let Ok(mut url) = Url::parse(link) else {
        return link.to_string();
    };
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "dl")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &pairs {
            query.append_pair(k, v);
        }
        query.append_pair("dl", &dl.to_string());
    }
    url.to_string()
}
