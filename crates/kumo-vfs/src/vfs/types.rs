//! Core VFS types.
//!
//! These are the shapes every transport normalizes into, and they are
//! serialized as-is on the local server's JSON API.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::VfsResult;
use super::path::{AsVirtualPath, VirtualPath};

/// Fallback mime type for files whose type the backend does not report.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Dir,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Dir)
    }
}

/// Description of one VFS entry.
///
/// Built fresh from every transport response and never mutated in place:
/// the `with_*` builders consume and return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Virtual, scheme-prefixed path.
    pub path: VirtualPath,
    /// Entry name; never contains a path separator.
    pub filename: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: FileType,
    /// Opaque backend id (Dropbox id, WebDAV etag).
    #[serde(default)]
    pub id: Option<String>,
}

impl FileMetadata {
    /// A file entry; the filename is taken from the path.
    pub fn file(path: VirtualPath, size: u64, mime: Option<String>) -> Self {
        Self {
            filename: path.filename().to_string(),
            path,
            mime,
            size,
            kind: FileType::File,
            id: None,
        }
    }

    /// A directory entry; the filename is taken from the path.
    pub fn dir(path: VirtualPath) -> Self {
        Self {
            filename: path.filename().to_string(),
            path,
            mime: None,
            size: 0,
            kind: FileType::Dir,
            id: None,
        }
    }

    /// The `..` entry pointing at `parent`.
    pub fn backlink(parent: VirtualPath) -> Self {
        Self {
            path: parent,
            filename: "..".to_string(),
            mime: None,
            size: 0,
            kind: FileType::Dir,
            id: None,
        }
    }

    pub fn with_id(self, id: Option<String>) -> Self {
        Self { id, ..self }
    }

    pub fn with_mime(self, mime: Option<String>) -> Self {
        Self { mime, ..self }
    }

    /// The same entry at another path, as after a copy or move.
    pub fn relocated(&self, path: VirtualPath) -> Self {
        Self {
            filename: path.filename().to_string(),
            path,
            mime: self.mime.clone(),
            size: self.size,
            kind: self.kind,
            id: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_backlink(&self) -> bool {
        self.filename == ".."
    }
}

impl AsVirtualPath for FileMetadata {
    fn to_virtual_path(&self) -> VfsResult<VirtualPath> {
        Ok(self.path.clone())
    }
}

/// File contents plus declared mime type.
///
/// Framing (text, data URI, ...) is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub data: Bytes,
    pub mime: String,
}

impl FileBlob {
    pub fn new(data: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime: mime.into(),
        }
    }

    /// Blob with the mime guessed from a filename.
    pub fn guessed(data: impl Into<Bytes>, filename: &str) -> Self {
        Self::new(data, guess_mime(filename))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A file handed to `upload`: name, contents, and extra form fields.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub blob: FileBlob,
    /// Caller metadata forwarded as extra multipart fields.
    pub fields: Vec<(String, String)>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, blob: FileBlob) -> Self {
        Self {
            filename: filename.into(),
            blob,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }
}

/// Options for `scandir`, applied by the dispatcher after the transport returns.
#[derive(Debug, Clone)]
pub struct ScandirOptions {
    /// Insert a `..` entry when not at the mount root.
    pub backlink: bool,
    /// Keep entries whose name starts with a dot.
    pub show_hidden: bool,
    /// Keep only files or only directories.
    pub type_filter: Option<FileType>,
    /// Mime patterns (`image/png`, `image/*`) files must match. Empty = all.
    pub mime_filter: Vec<String>,
}

impl Default for ScandirOptions {
    fn default() -> Self {
        Self {
            backlink: true,
            show_hidden: true,
            type_filter: None,
            mime_filter: Vec::new(),
        }
    }
}

impl ScandirOptions {
    /// Raw listing: no backlink, no filtering.
    pub fn raw() -> Self {
        Self {
            backlink: false,
            ..Default::default()
        }
    }

    /// Returns true if the entry passes the filters.
    pub fn accepts(&self, entry: &FileMetadata) -> bool {
        if entry.is_backlink() {
            return true;
        }
        if !self.show_hidden && entry.filename.starts_with('.') {
            return false;
        }
        if self.type_filter.is_some_and(|kind| entry.kind != kind) {
            return false;
        }
        if entry.is_file() && !self.mime_filter.is_empty() {
            let mime = entry.mime.as_deref().unwrap_or(DEFAULT_MIME);
            return self.mime_filter.iter().any(|p| mime_matches(p, mime));
        }
        true
    }
}

/// Options for `url`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlOptions {
    /// Dropbox-style download flag for reused links; `Some(0)` keeps a
    /// preview link as-is, unset means a direct download (`dl=1`).
    pub dl: Option<u8>,
}

/// Options for copy, move, mkdir and upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    /// Skip the dispatcher's "target already exists" check.
    pub overwrite: bool,
}

impl TransferOptions {
    pub fn overwrite() -> Self {
        Self { overwrite: true }
    }
}

/// Search query for `find`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindQuery {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: None,
        }
    }

    pub fn with_limit(self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }
}

/// Guess a mime type from a filename.
pub fn guess_mime(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}

/// Match `image/png` against patterns like `image/png`, `image/*` or `*/*`.
fn mime_matches(pattern: &str, mime: &str) -> bool {
    match pattern.split_once('/') {
        Some((major, "*")) => major == "*" || mime.split('/').next() == Some(major),
        _ => pattern.eq_ignore_ascii_case(mime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[test]
    fn test_file_metadata_constructors() {
        let file = FileMetadata::file(vp("home:///docs/a.txt"), 12, Some("text/plain".into()));
        assert_eq!(file.filename, "a.txt");
        assert!(file.is_file());
        assert!(!file.filename.contains('/'));

        let dir = FileMetadata::dir(vp("home:///docs"));
        assert!(dir.is_dir());
        assert_eq!(dir.size, 0);

        let back = FileMetadata::backlink(vp("home:///"));
        assert!(back.is_backlink());
        assert_eq!(back.path.to_string(), "home:///");
    }

    #[test]
    fn test_wire_shape() {
        let file = FileMetadata::file(vp("home:///a.txt"), 3, None).with_id(Some("x1".into()));
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["path"], "home:///a.txt");
        assert_eq!(json["type"], "file");
        assert_eq!(json["id"], "x1");

        let parsed: FileMetadata = serde_json::from_str(
            r#"{"path":"home:///sub","filename":"sub","type":"dir"}"#,
        )
        .unwrap();
        assert!(parsed.is_dir());
        assert_eq!(parsed.mime, None);
    }

    #[test]
    fn test_scandir_filters() {
        let hidden = FileMetadata::file(vp("home:///.env"), 1, Some("text/plain".into()));
        let png = FileMetadata::file(vp("home:///a.png"), 1, Some("image/png".into()));
        let dir = FileMetadata::dir(vp("home:///sub"));

        let opts = ScandirOptions {
            show_hidden: false,
            ..Default::default()
        };
        assert!(!opts.accepts(&hidden));
        assert!(opts.accepts(&FileMetadata::backlink(vp("home:///"))));

        let opts = ScandirOptions {
            mime_filter: vec!["image/*".into()],
            ..Default::default()
        };
        assert!(opts.accepts(&png));
        assert!(opts.accepts(&dir));
        assert!(!opts.accepts(&hidden));

        let opts = ScandirOptions {
            type_filter: Some(FileType::Dir),
            ..Default::default()
        };
        assert!(opts.accepts(&dir));
        assert!(!opts.accepts(&png));
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("a.txt"), "text/plain");
        assert_eq!(guess_mime("noext"), DEFAULT_MIME);
    }
}
