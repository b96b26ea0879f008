//! Transport for the local server's JSON API.
//!
//! Each verb is one `POST <api_root>/<verb>` with a JSON body; `write` and
//! `upload` go through multipart `upload` with a pre-flight size check.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;

use crate::vfs::connection::{Connection, decode_envelope};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::VirtualPath;
use crate::vfs::transport::Transport;
use crate::vfs::types::{FileBlob, FileMetadata, FindQuery, UploadFile, UrlOptions};

pub struct OsjsTransport {
    connection: Connection,
}

impl OsjsTransport {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl Transport for OsjsTransport {
    fn kind(&self) -> &'static str {
        "osjs"
    }

    async fn scandir(&self, dir: &VirtualPath) -> VfsResult<Vec<FileMetadata>> {
        self.connection
            .request("scandir", &json!({ "path": dir }))
            .await
    }

    async fn read(&self, file: &VirtualPath) -> VfsResult<FileBlob> {
        let response = self
            .connection
            .request_raw("read", &json!({ "path": file }))
            .await?;

        if !response.status().is_success() {
            // Errors come back as the JSON envelope; an envelope without one
            // still carries no file.
            decode_envelope::<serde_json::Value>(response).await?;
            return Err(VfsError::empty_remote(file.to_string()));
        }

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| VfsError::empty_remote(file.to_string()))?;
        let data = response.bytes().await?;
        Ok(FileBlob::new(data, mime))
    }

    async fn fileinfo(&self, file: &VirtualPath) -> VfsResult<FileMetadata> {
        self.connection
            .request("fileinfo", &json!({ "path": file }))
            .await
    }

    async fn exists(&self, file: &VirtualPath) -> VfsResult<bool> {
        self.connection
            .request("exists", &json!({ "path": file }))
            .await
    }

    async fn find(&self, dir: &VirtualPath, query: &FindQuery) -> VfsResult<Vec<FileMetadata>> {
        self.connection
            .request("find", &json!({ "path": dir, "args": query }))
            .await
    }

    async fn url(&self, file: &VirtualPath, _opts: &UrlOptions) -> VfsResult<String> {
        self.connection.read_url(&file.to_string())
    }

    async fn free_space(&self, root: &VirtualPath) -> i64 {
        match self
            .connection
            .request::<_, i64>("freeSpace", &json!({ "root": root }))
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(root = %root, error = %e, "free space lookup failed");
                -1
            }
        }
    }

    async fn write(&self, file: &VirtualPath, blob: FileBlob) -> VfsResult<()> {
        let upload = UploadFile::new(file.filename(), blob);
        self.connection
            .upload(&file.parent(), upload, true)
            .await
            .map(|_| ())
    }

    // The overwrite guard already ran in the dispatcher.
    async fn copy(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        self.connection
            .request::<_, bool>("copy", &json!({ "src": src, "dest": dst, "overwrite": true }))
            .await
            .map(|_| ())
    }

    async fn rename(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        self.connection
            .request::<_, bool>("move", &json!({ "src": src, "dest": dst, "overwrite": true }))
            .await
            .map(|_| ())
    }

    async fn unlink(&self, file: &VirtualPath) -> VfsResult<()> {
        self.connection
            .request::<_, bool>("unlink", &json!({ "path": file }))
            .await
            .map(|_| ())
    }

    async fn mkdir(&self, dir: &VirtualPath) -> VfsResult<()> {
        self.connection
            .request::<_, bool>("mkdir", &json!({ "path": dir }))
            .await
            .map(|_| ())
    }

    async fn upload(&self, dir: &VirtualPath, file: UploadFile) -> VfsResult<FileMetadata> {
        self.connection.upload(dir, file, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::connection::ConnectionSettings;

    #[tokio::test]
    async fn test_too_large_fails_before_network() {
        // Nothing listens on this port; reaching the network would be a Wire error.
        let conn = Connection::new(&ConnectionSettings {
            api_root: "http://127.0.0.1:9/FS".into(),
            max_upload_size: 4,
            request_timeout_secs: 1,
        })
        .unwrap();
        let t = OsjsTransport::new(conn);

        let err = t
            .write(
                &VirtualPath::parse("home:///big.bin").unwrap(),
                FileBlob::new(vec![0u8; 5], "application/octet-stream"),
            )
            .await
            .unwrap_err();
        assert_eq!(err, VfsError::TooLarge { size: 5, limit: 4 });
    }

    #[tokio::test]
    async fn test_url_points_at_read_endpoint() {
        let t = OsjsTransport::new(Connection::new(&ConnectionSettings::default()).unwrap());
        let url = t
            .url(&VirtualPath::parse("home:///a.txt").unwrap(), &UrlOptions::default())
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8000/FS/read?path=home%3A%2F%2F%2Fa.txt");
    }
}
