//! Transport trait.
//!
//! One implementation per backend protocol. Every verb takes virtual paths
//! that the dispatcher has already resolved to this transport's mount point;
//! a transport derives its native form with [`VirtualPath::native`].
//!
//! Verbs a backend cannot serve keep the default body, which fails with
//! [`VfsError::Unavailable`].

use async_trait::async_trait;
use strum::{AsRefStr, Display, EnumString};

use super::error::{VfsError, VfsResult};
use super::path::VirtualPath;
use super::types::{FileBlob, FileMetadata, FindQuery, UploadFile, UrlOptions};

/// The uniform verb set. The string form is the wire/endpoint name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum Verb {
    Scandir,
    Read,
    Write,
    Copy,
    Move,
    Unlink,
    Mkdir,
    Exists,
    Fileinfo,
    Find,
    Url,
    FreeSpace,
    Upload,
}

impl Verb {
    /// Verbs rejected on read-only mount points.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Verb::Write | Verb::Copy | Verb::Move | Verb::Unlink | Verb::Mkdir | Verb::Upload
        )
    }
}

/// Core transport operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short protocol name (`osjs`, `webdav`, `dropbox`, `memory`).
    fn kind(&self) -> &'static str;

    /// Whether the backend can currently be used at all (e.g. it has the
    /// configuration it needs). Re-checked on every resolution.
    fn enabled(&self) -> bool {
        true
    }

    /// Bring the transport to a usable state before its mount point is
    /// marked mounted.
    async fn ready(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Drop cached client state; called when the mount point is unmounted.
    async fn teardown(&self) {}

    /// End the backend session (revoke credentials where supported).
    async fn sign_out(&self) -> VfsResult<()> {
        self.teardown().await;
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Immediate children of `dir`, in a stable order.
    async fn scandir(&self, dir: &VirtualPath) -> VfsResult<Vec<FileMetadata>> {
        let _ = dir;
        Err(VfsError::unavailable(Verb::Scandir.as_ref()))
    }

    /// Whole-file contents.
    async fn read(&self, file: &VirtualPath) -> VfsResult<FileBlob> {
        let _ = file;
        Err(VfsError::unavailable(Verb::Read.as_ref()))
    }

    /// Metadata for a single entry.
    async fn fileinfo(&self, file: &VirtualPath) -> VfsResult<FileMetadata> {
        let _ = file;
        Err(VfsError::unavailable(Verb::Fileinfo.as_ref()))
    }

    /// Search beneath `dir`.
    async fn find(&self, dir: &VirtualPath, query: &FindQuery) -> VfsResult<Vec<FileMetadata>> {
        let _ = (dir, query);
        Err(VfsError::unavailable(Verb::Find.as_ref()))
    }

    /// A URL the file can be fetched from.
    async fn url(&self, file: &VirtualPath, opts: &UrlOptions) -> VfsResult<String> {
        let _ = (file, opts);
        Err(VfsError::unavailable(Verb::Url.as_ref()))
    }

    /// Free bytes on the backend, or -1 when unknown. Never fails.
    async fn free_space(&self, root: &VirtualPath) -> i64 {
        let _ = root;
        -1
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write (create or overwrite) a file.
    async fn write(&self, file: &VirtualPath, blob: FileBlob) -> VfsResult<()> {
        let _ = (file, blob);
        Err(VfsError::unavailable(Verb::Write.as_ref()))
    }

    async fn copy(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        let _ = (src, dst);
        Err(VfsError::unavailable(Verb::Copy.as_ref()))
    }

    async fn rename(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        let _ = (src, dst);
        Err(VfsError::unavailable(Verb::Move.as_ref()))
    }

    async fn unlink(&self, file: &VirtualPath) -> VfsResult<()> {
        let _ = file;
        Err(VfsError::unavailable(Verb::Unlink.as_ref()))
    }

    async fn mkdir(&self, dir: &VirtualPath) -> VfsResult<()> {
        let _ = dir;
        Err(VfsError::unavailable(Verb::Mkdir.as_ref()))
    }

    /// Store `file` inside `dir`, returning the new entry.
    async fn upload(&self, dir: &VirtualPath, file: UploadFile) -> VfsResult<FileMetadata> {
        let target = dir.child(&file.filename)?;
        let size = file.blob.len() as u64;
        let mime = file.blob.mime.clone();
        self.write(&target, file.blob).await?;
        Ok(FileMetadata::file(target, size, Some(mime)))
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    ///
    /// Uses `fileinfo`; reading the file is only a fallback for transports
    /// with no metadata call.
    async fn exists(&self, file: &VirtualPath) -> VfsResult<bool> {
        match self.fileinfo(file).await {
            Ok(_) => Ok(true),
            Err(VfsError::NotFound(_)) => Ok(false),
            Err(VfsError::Unavailable(_)) => match self.read(file).await {
                Ok(_) => Ok(true),
                Err(VfsError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}
