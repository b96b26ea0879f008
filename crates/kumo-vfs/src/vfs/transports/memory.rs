//! In-memory transport.
//!
//! Used for scratch mounts and testing. All data is ephemeral.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::VirtualPath;
use crate::vfs::transport::Transport;
use crate::vfs::types::{FileBlob, FileMetadata, FindQuery, UrlOptions};

type Key = Vec<String>;

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Bytes, mime: String },
    Directory,
}

/// In-memory transport.
///
/// Keys are path segments; the root (empty key) always exists. A `BTreeMap`
/// keeps listings in a stable order.
#[derive(Debug)]
pub struct MemoryTransport {
    entries: RwLock<BTreeMap<Key, Entry>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Vec::new(), Entry::Directory);
        Self {
            entries: RwLock::new(entries),
        }
    }

    fn key(path: &VirtualPath) -> Key {
        path.segments().to_vec()
    }

    fn metadata(path: &VirtualPath, entry: &Entry) -> FileMetadata {
        match entry {
            Entry::File { data, mime } => {
                FileMetadata::file(path.clone(), data.len() as u64, Some(mime.clone()))
            }
            Entry::Directory => FileMetadata::dir(path.clone()),
        }
    }

    fn rebase(scheme: &str, segments: &[String]) -> VirtualPath {
        segments
            .iter()
            .fold(VirtualPath::root(scheme), |p, s| {
                p.join(s).unwrap_or_else(|_| p.clone())
            })
    }

    /// The parent directory must exist for anything to be created in it.
    fn check_parent(entries: &BTreeMap<Key, Entry>, path: &VirtualPath) -> VfsResult<()> {
        match entries.get(&Self::key(&path.parent())) {
            Some(Entry::Directory) => Ok(()),
            Some(Entry::File { .. }) => Err(VfsError::invalid_path(format!(
                "parent is not a directory: {path}"
            ))),
            None => Err(VfsError::not_found(path.parent().to_string())),
        }
    }

    /// Clone `from` and everything beneath it onto `to`.
    fn subtree(entries: &BTreeMap<Key, Entry>, from: &Key, to: &Key) -> Vec<(Key, Entry)> {
        entries
            .iter()
            .filter(|(k, _)| k.starts_with(from))
            .map(|(k, e)| {
                let mut target = to.clone();
                target.extend_from_slice(&k[from.len()..]);
                (target, e.clone())
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn scandir(&self, dir: &VirtualPath) -> VfsResult<Vec<FileMetadata>> {
        let key = Self::key(dir);
        let entries = self.entries.read();

        match entries.get(&key) {
            Some(Entry::Directory) => {}
            Some(Entry::File { .. }) => {
                return Err(VfsError::invalid_path(format!("not a directory: {dir}")));
            }
            None => return Err(VfsError::not_found(dir.to_string())),
        }

        Ok(entries
            .iter()
            .filter(|(k, _)| k.len() == key.len() + 1 && k.starts_with(&key))
            .map(|(k, e)| Self::metadata(&Self::rebase(dir.scheme(), k), e))
            .collect())
    }

    async fn read(&self, file: &VirtualPath) -> VfsResult<FileBlob> {
        match self.entries.read().get(&Self::key(file)) {
            Some(Entry::File { data, mime }) => Ok(FileBlob::new(data.clone(), mime.clone())),
            Some(Entry::Directory) => {
                Err(VfsError::invalid_path(format!("is a directory: {file}")))
            }
            None => Err(VfsError::not_found(file.to_string())),
        }
    }

    async fn fileinfo(&self, file: &VirtualPath) -> VfsResult<FileMetadata> {
        self.entries
            .read()
            .get(&Self::key(file))
            .map(|e| Self::metadata(file, e))
            .ok_or_else(|| VfsError::not_found(file.to_string()))
    }

    async fn exists(&self, file: &VirtualPath) -> VfsResult<bool> {
        Ok(self.entries.read().contains_key(&Self::key(file)))
    }

    async fn find(&self, dir: &VirtualPath, query: &FindQuery) -> VfsResult<Vec<FileMetadata>> {
        let key = Self::key(dir);
        let needle = query.query.to_lowercase();
        let limit = query.limit.unwrap_or(usize::MAX);

        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(k, _)| k.len() > key.len() && k.starts_with(&key))
            .filter(|(k, _)| {
                k.last()
                    .is_some_and(|name| name.to_lowercase().contains(&needle))
            })
            .take(limit)
            .map(|(k, e)| Self::metadata(&Self::rebase(dir.scheme(), k), e))
            .collect())
    }

    async fn url(&self, file: &VirtualPath, _opts: &UrlOptions) -> VfsResult<String> {
        let blob = self.read(file).await?;
        Ok(format!("data:{};base64,{}", blob.mime, STANDARD.encode(&blob.data)))
    }

    async fn write(&self, file: &VirtualPath, blob: FileBlob) -> VfsResult<()> {
        if file.is_root() {
            return Err(VfsError::invalid_path(file.to_string()));
        }
        let mut entries = self.entries.write();
        Self::check_parent(&entries, file)?;

        let key = Self::key(file);
        if let Some(Entry::Directory) = entries.get(&key) {
            return Err(VfsError::invalid_path(format!("is a directory: {file}")));
        }
        entries.insert(
            key,
            Entry::File {
                data: blob.data,
                mime: blob.mime,
            },
        );
        Ok(())
    }

    async fn copy(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        let mut entries = self.entries.write();
        let from = Self::key(src);
        if !entries.contains_key(&from) {
            return Err(VfsError::not_found(src.to_string()));
        }
        Self::check_parent(&entries, dst)?;

        let copied = Self::subtree(&entries, &from, &Self::key(dst));
        entries.extend(copied);
        Ok(())
    }

    async fn rename(&self, src: &VirtualPath, dst: &VirtualPath) -> VfsResult<()> {
        let mut entries = self.entries.write();
        let from = Self::key(src);
        let to = Self::key(dst);
        if from.is_empty() {
            return Err(VfsError::invalid_path("cannot move root"));
        }
        if !entries.contains_key(&from) {
            return Err(VfsError::not_found(src.to_string()));
        }
        if to.starts_with(&from) {
            return Err(VfsError::invalid_path(format!("{dst} is inside {src}")));
        }
        Self::check_parent(&entries, dst)?;

        let moved = Self::subtree(&entries, &from, &to);
        entries.retain(|k, _| !k.starts_with(&from));
        entries.extend(moved);
        Ok(())
    }

    async fn unlink(&self, file: &VirtualPath) -> VfsResult<()> {
        let key = Self::key(file);
        if key.is_empty() {
            return Err(VfsError::invalid_path("cannot remove root"));
        }

        let mut entries = self.entries.write();
        if !entries.contains_key(&key) {
            return Err(VfsError::not_found(file.to_string()));
        }
        entries.retain(|k, _| !k.starts_with(&key));
        Ok(())
    }

    async fn mkdir(&self, dir: &VirtualPath) -> VfsResult<()> {
        let mut entries = self.entries.write();
        let key = Self::key(dir);
        if entries.contains_key(&key) {
            return Err(VfsError::exists(dir.to_string()));
        }
        Self::check_parent(&entries, dir)?;
        entries.insert(key, Entry::Directory);
        Ok(())
    }
}
