//! Local filesystem transport.
//!
//! Serves one directory tree as a mount point, with path security to
//! prevent escaping the root directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use kumo_vfs::vfs::{FindQuery, UrlOptions, guess_mime};
use kumo_vfs::{FileBlob, FileMetadata, Transport, VfsError, VfsResult, VirtualPath};

/// Local filesystem transport.
///
/// All operations are relative to `root`: `home:///src/main.rs` on a
/// transport rooted at `/home/amy` is `/home/amy/src/main.rs`.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// The root is canonicalized at construction time so symlinked roots
    /// (e.g. macOS `/tmp` → `/private/tmp`) compare correctly later.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a virtual path onto the disk. Paths that resolve outside the
    /// root, through symlinks included, are rejected.
    fn resolve(&self, path: &VirtualPath) -> VfsResult<PathBuf> {
        let full = path
            .segments()
            .iter()
            .fold(self.root.clone(), |acc, s| acc.join(s));

        // Canonicalize the deepest existing ancestor; the rest does not
        // exist yet and cannot be a symlink.
        let mut existing = full.as_path();
        let mut tail = Vec::new();
        while !existing.exists() {
            let Some(name) = existing.file_name() else {
                break;
            };
            tail.push(name.to_os_string());
            existing = match existing.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        let mut canonical = dunce::canonicalize(existing).map_err(VfsError::from)?;
        for name in tail.into_iter().rev() {
            canonical.push(name);
        }

        if !canonical.starts_with(&self.root) {
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }
        Ok(canonical)
    }

    fn metadata(path: VirtualPath, meta: &std::fs::Metadata) -> FileMetadata {
        if meta.is_dir() {
            FileMetadata::dir(path)
        } else {
            let mime = guess_mime(path.filename());
            FileMetadata::file(path, meta.len(), Some(mime))
        }
    }

    async fn copy_tree(from: PathBuf, to: PathBuf) -> VfsResult<()> {
        let mut pending = vec![(from, to)];
        while let Some((from, to)) = pending.pop() {
            if fs::metadata(&from).await?.is_dir() {
                fs::create_dir(&to).await?;
                let mut dir = fs::read_dir(&from).await?;
                while let Some(entry) = dir.next_entry().await? {
                    pending.push((entry.path(), to.join(entry.file_name())));
                }
            } else {
                fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn ready(&self) -> VfsResult<()> {
        if fs::metadata(&self.root).await?.is_dir() {
            Ok(())
        } else {
            Err(VfsError::config(format!("{} is not a directory", self.root.display())))
        }
    }

    async fn scandir(&self, dir: &VirtualPath) -> VfsResult<Vec<FileMetadata>> {
        let full = self.resolve(dir)?;
        let mut entries = Vec::new();
        let mut listing = fs::read_dir(&full).await?;

        while let Some(entry) = listing.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Dangling symlinks have no metadata; skip them.
            let Ok(meta) = fs::metadata(entry.path()).await else {
                continue;
            };
            entries.push(Self::metadata(dir.join(&name)?, &meta));
        }

        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }

    async fn read(&self, file: &VirtualPath) -> VfsResult<FileBlob> {
        let full = self.resolve(file)?;
        if fs::metadata(&full).await?.is_dir() {
            return Err(VfsError::invalid_path(format!("is a directory: {file}")));
        }
        let data = fs::read(&full).await?;
        Ok(FileBlob::guessed(Bytes::from(data), file.filename()))
    }

    async fn fileinfo(&self, file: &VirtualPath) -> VfsResult<FileMetadata> {
        let meta = fs::metadata(self.resolve(file)?).await?;
        Ok(Self::metadata(file.clone(), &meta))
    }

    async fn exists(&self, file: &VirtualPath) -> VfsResult<bool> {
        Ok(fs::try_exists(self.resolve(file)?).await?)
    }

    async fn find(&self, dir: &VirtualPath, query: &FindQuery) -> VfsResult<Vec<FileMetadata>> {
        let needle = query.query.to_lowercase();
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        let mut pending = vec![dir.clone()];

        while let Some(current) = pending.pop() {
            for entry in self.scandir(&current).await? {
                if entry.is_dir() {
                    pending.push(entry.path.clone());
                }
                if entry.filename.to_lowercase().contains(&needle) {
                    found.push(entry);
                    if found.len() >= limit {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(found)
    }

    async fn url(&self, file: &VirtualPath, _opts: &UrlOptions) -> VfsResult<String> {
        let full = self.resolve(file)?;
        url::Url::from_file_path(&full)
            .map(String::from)
            .map_err(|_| VfsError::invalid_path(full.display().to_string()))
    }

    async fn free_space(&self, _root: &VirtualPath) -> i64 {
        free_space(&self.root)
    }

    async fn write(&self, file: &VirtualPath, blob: FileBlob) -> VfsResult<()> {
        let full = self.resolve(file)?;
        Ok(fs::write(&full, &blob.data).await?)
    }

    async fn copy(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        Self::copy_tree(self.resolve(src)?, self.resolve(dst)?).await
    }

    async fn rename(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        Ok(fs::rename(self.resolve(src)?, self.resolve(dst)?).await?)
    }

    async fn unlink(&self, file: &VirtualPath) -> VfsResult<()> {
        if file.is_root() {
            return Err(VfsError::invalid_path("cannot remove root"));
        }
        let full = self.resolve(file)?;
        if fs::metadata(&full).await?.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn mkdir(&self, dir: &VirtualPath) -> VfsResult<()> {
        Ok(fs::create_dir(self.resolve(dir)?).await?)
    }
}

#[cfg(unix)]
fn free_space(root: &Path) -> i64 {
    match rustix::fs::statvfs(root) {
        Ok(stat) => (stat.f_bavail.saturating_mul(stat.f_frsize)) as i64,
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "statvfs failed");
            -1
        }
    }
}

#[cfg(not(unix))]
fn free_space(_root: &Path) -> i64 {
    -1
}
