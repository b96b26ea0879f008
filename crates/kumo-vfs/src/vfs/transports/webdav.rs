//! WebDAV transport.
//!
//! `scandir` is a depth-1 `PROPFIND` whose multistatus reply is parsed with
//! the configured XML namespace. Reads and writes are `GET`/`PUT`; the
//! remaining verbs map onto `DELETE`, `COPY`, `MOVE`, `MKCOL` and a depth-0
//! `PROPFIND`.
//!
//! A mount that is not CORS-enabled sends every request through the local
//! server's `curl` verb instead of talking to the host directly. Callers
//! cannot tell the two routes apart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::vfs::connection::{Connection, FetchRequest};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::VirtualPath;
use crate::vfs::transport::Transport;
use crate::vfs::types::{DEFAULT_MIME, FileBlob, FileMetadata, UrlOptions, guess_mime};

/// Default XML namespace of DAV properties.
pub const DEFAULT_NAMESPACE: &str = "DAV:";

/// Status codes treated as success.
const ACCEPTED: &[u16] = &[200, 201, 203, 204, 205, 207];

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<propfind xmlns="DAV:"><allprop/></propfind>"#;

/// Per-mount WebDAV options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebdavSettings {
    pub host: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Talk to the host directly instead of through the server proxy.
    #[serde(default)]
    pub cors: bool,
    #[serde(default)]
    pub ns: Option<String>,
}

/// A response, whichever route it took.
#[derive(Debug)]
struct DavResponse {
    status: u16,
    content_type: Option<String>,
    body: Bytes,
}

pub struct WebdavTransport {
    host: Url,
    username: Option<String>,
    password: Option<String>,
    namespace: String,
    client: reqwest::Client,
    /// Set for non-CORS mounts.
    proxy: Option<Connection>,
}

impl WebdavTransport {
    /// `connection` is the local server used as proxy when `cors` is off.
    pub fn new(settings: WebdavSettings, connection: Connection) -> VfsResult<Self> {
        let mut host = Url::parse(&settings.host)?;
        if host.cannot_be_a_base() {
            return Err(VfsError::config(format!("invalid WebDAV host: {}", settings.host)));
        }
        // Credentials travel separately from the host.
        let _ = host.set_username("");
        let _ = host.set_password(None);

        let mut namespace = settings
            .ns
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if !namespace.ends_with(':') {
            namespace.push(':');
        }

        Ok(Self {
            host,
            username: settings.username,
            password: settings.password,
            namespace,
            client: connection.client().clone(),
            proxy: (!settings.cors).then_some(connection),
        })
    }

    /// Host URL with the path's segments appended. Collections get a
    /// trailing slash.
    fn target_url(&self, path: &VirtualPath, collection: bool) -> Url {
        let mut url = self.host.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path.segments());
            if collection && !path.is_root() {
                segments.push("");
            }
        }
        if collection && path.is_root() && !url.path().ends_with('/') {
            let with_slash = format!("{}/", url.path());
            url.set_path(&with_slash);
        }
        url
    }

    fn basic_auth(&self) -> Option<String> {
        self.username.as_ref().map(|user| {
            let pass = self.password.as_deref().unwrap_or("");
            format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
        })
    }

    /// Send a request and check its status.
    async fn request(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, String)],
        body: Option<Bytes>,
    ) -> VfsResult<DavResponse> {
        let response = self.send(method, url, headers, body).await?;
        match response.status {
            s if ACCEPTED.contains(&s) => Ok(response),
            404 => Err(VfsError::not_found(url.path().to_string())),
            s => Err(VfsError::wire(format!("{method} {url} returned HTTP {s}"))),
        }
    }

    async fn send(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, String)],
        body: Option<Bytes>,
    ) -> VfsResult<DavResponse> {
        tracing::trace!(%method, %url, proxied = self.proxy.is_some(), "webdav request");

        Ok(match &self.proxy {
            Some(proxy) => {
                let mut req = FetchRequest::new(method, url.as_str());
                for (k, v) in headers {
                    req = req.header(*k, v.clone());
                }
                if let Some(auth) = self.basic_auth() {
                    req = req.header("Authorization", auth);
                }
                if let Some(body) = &body {
                    req = req.body(body);
                }
                let resp = proxy.fetch(&req).await?;
                DavResponse {
                    status: resp.status,
                    content_type: resp.header("content-type").map(str::to_string),
                    body: resp.decoded_body()?,
                }
            }
            None => {
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|e| VfsError::wire(format!("bad method {method}: {e}")))?;
                let mut builder = self.client.request(method, url.clone());
                for (k, v) in headers {
                    builder = builder.header(*k, v.as_str());
                }
                if let Some(user) = &self.username {
                    builder = builder.basic_auth(user, self.password.as_ref());
                }
                if let Some(body) = body {
                    builder = builder.body(body);
                }
                let resp = builder.send().await?;
                let status = resp.status().as_u16();
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                DavResponse {
                    status,
                    content_type,
                    body: resp.bytes().await?,
                }
            }
        })
    }

    async fn propfind(&self, path: &VirtualPath, depth: &str) -> VfsResult<Vec<FileMetadata>> {
        let url = self.target_url(path, depth != "0" || path.is_root());
        let headers = [
            ("Depth", depth.to_string()),
            ("Content-Type", "application/xml".to_string()),
        ];
        let response = self
            .request("PROPFIND", &url, &headers, Some(Bytes::from_static(PROPFIND_BODY.as_bytes())))
            .await?;
        let xml = std::str::from_utf8(&response.body)
            .map_err(|e| VfsError::wire(format!("multistatus is not UTF-8: {e}")))?;

        parse_multistatus(xml, &self.namespace, self.host.path(), path.scheme())
    }
}

#[async_trait]
impl Transport for WebdavTransport {
    fn kind(&self) -> &'static str {
        "webdav"
    }

    async fn scandir(&self, dir: &VirtualPath) -> VfsResult<Vec<FileMetadata>> {
        let entries = self.propfind(dir, "1").await?;
        Ok(entries.into_iter().filter(|e| &e.path != dir).collect())
    }

    async fn read(&self, file: &VirtualPath) -> VfsResult<FileBlob> {
        let url = self.target_url(file, false);
        let response = self.request("GET", &url, &[], None).await?;
        let mime = response
            .content_type
            .unwrap_or_else(|| guess_mime(file.filename()));
        Ok(FileBlob::new(response.body, mime))
    }

    async fn fileinfo(&self, file: &VirtualPath) -> VfsResult<FileMetadata> {
        let entries = self.propfind(file, "0").await?;
        entries
            .into_iter()
            .find(|e| &e.path == file)
            .ok_or_else(|| VfsError::not_found(file.to_string()))
    }

    async fn url(&self, file: &VirtualPath, _opts: &UrlOptions) -> VfsResult<String> {
        let mut target = self.target_url(file, false);
        match &self.proxy {
            None => Ok(target.to_string()),
            Some(proxy) => {
                // The server fetches this URL itself, so it needs the credentials.
                if let Some(user) = &self.username {
                    let _ = target.set_username(user);
                    let _ = target.set_password(self.password.as_deref());
                }
                proxy.read_url(target.as_str())
            }
        }
    }

    async fn write(&self, file: &VirtualPath, blob: FileBlob) -> VfsResult<()> {
        let url = self.target_url(file, false);
        let headers = [("Content-Type", blob.mime.clone())];
        self.request("PUT", &url, &headers, Some(blob.data)).await?;
        Ok(())
    }

    async fn copy(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        let headers = [
            ("Destination", self.target_url(dst, false).to_string()),
            ("Overwrite", "T".to_string()),
        ];
        self.request("COPY", &self.target_url(src, false), &headers, None)
            .await?;
        Ok(())
    }

    async fn rename(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        let headers = [
            ("Destination", self.target_url(dst, false).to_string()),
            ("Overwrite", "T".to_string()),
        ];
        self.request("MOVE", &self.target_url(src, false), &headers, None)
            .await?;
        Ok(())
    }

    async fn unlink(&self, file: &VirtualPath) -> VfsResult<()> {
        self.request("DELETE", &self.target_url(file, false), &[], None)
            .await?;
        Ok(())
    }

    async fn mkdir(&self, dir: &VirtualPath) -> VfsResult<()> {
        let url = self.target_url(dir, true);
        // MKCOL on an existing resource is "method not allowed".
        let response = self.send("MKCOL", &url, &[], None).await?;
        match response.status {
            405 => Err(VfsError::exists(dir.to_string())),
            409 => Err(VfsError::not_found(dir.parent().to_string())),
            s if ACCEPTED.contains(&s) => Ok(()),
            s => Err(VfsError::wire(format!("MKCOL {url} returned HTTP {s}"))),
        }
    }
}

/// Parse a `PROPFIND` multistatus document into entries.
///
/// `base_path` is the (encoded) path component of the configured host; hrefs
/// are made relative to it and an href outside it is a `Wire` error. The self
/// entry is kept, callers filter it.
pub(crate) fn parse_multistatus(
    xml: &str,
    namespace: &str,
    base_path: &str,
    scheme: &str,
) -> VfsResult<Vec<FileMetadata>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| VfsError::wire(format!("bad multistatus: {e}")))?;

    let prop_text = |node: roxmltree::Node, name: &str| {
        node.descendants()
            .find(|n| n.has_tag_name((namespace, name)))
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };

    let base = percent_decode_str(base_path.trim_end_matches('/')).decode_utf8_lossy();
    let mut entries = Vec::new();
    let mut seen = BTreeMap::new();

    for response in doc
        .descendants()
        .filter(|n| n.has_tag_name((namespace, "response")))
    {
        let Some(href) = prop_text(response, "href") else {
            continue;
        };

        // Hrefs may be absolute URLs or absolute paths.
        let href_path = match Url::parse(&href) {
            Ok(url) => url.path().to_string(),
            Err(_) => href,
        };
        let decoded = percent_decode_str(&href_path).decode_utf8_lossy();
        let relative = decoded
            .strip_prefix(&*base)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .ok_or_else(|| VfsError::wire(format!("href {href_path} is outside {base_path}")))?;

        let is_collection = relative.ends_with('/')
            || response
                .descendants()
                .any(|n| n.has_tag_name((namespace, "collection")));

        let path = VirtualPath::from_native(scheme, relative)?;
        if seen.insert(path.to_string(), ()).is_some() {
            continue;
        }

        let id = prop_text(response, "getetag").map(|t| t.trim_matches('"').to_string());
        let entry = if is_collection {
            FileMetadata::dir(path)
        } else {
            let size = prop_text(response, "getcontentlength")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let mime = prop_text(response, "getcontenttype")
                .unwrap_or_else(|| DEFAULT_MIME.to_string());
            FileMetadata::file(path, size, Some(mime))
        };
        entries.push(entry.with_id(id));
    }

    Ok(entries)
}
