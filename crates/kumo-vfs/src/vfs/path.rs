//! Scheme-prefixed virtual paths.
//!
//! A virtual path looks like `home:///docs/a.txt`: a scheme selecting the
//! mount point, then the backend-relative segments. Paths are parsed once at
//! the dispatcher boundary and passed around in typed form afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{VfsError, VfsResult};

/// Separator between scheme and path.
const SCHEME_SEPARATOR: &str = "://";

/// A parsed virtual path: scheme plus normalized path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath {
    scheme: String,
    segments: Vec<String>,
}

impl VirtualPath {
    /// Parse `scheme://path`.
    ///
    /// Empty segments and `.` are dropped; `..` pops a segment. A `..` that
    /// would climb above the mount root is rejected.
    pub fn parse(input: &str) -> VfsResult<Self> {
        let (scheme, rest) = input
            .split_once(SCHEME_SEPARATOR)
            .ok_or_else(|| VfsError::invalid_path(format!("missing scheme: {input}")))?;

        if !is_valid_scheme(scheme) {
            return Err(VfsError::invalid_path(format!("bad scheme: {input}")));
        }

        let segments = normalize_segments(rest)
            .ok_or_else(|| VfsError::invalid_path(format!("escapes mount root: {input}")))?;

        Ok(Self {
            scheme: scheme.to_string(),
            segments,
        })
    }

    /// The root of a scheme (`home:///`).
    pub fn root(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            segments: Vec::new(),
        }
    }

    /// Build a virtual path from a backend-native path like `/docs/a.txt`.
    pub fn from_native(scheme: impl Into<String>, native: &str) -> VfsResult<Self> {
        let segments = normalize_segments(native)
            .ok_or_else(|| VfsError::invalid_path(format!("escapes mount root: {native}")))?;
        Ok(Self {
            scheme: scheme.into(),
            segments,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Backend-native form: `/docs/a.txt`, or `/` at the root.
    pub fn native(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// Last segment, or an empty string at the root.
    pub fn filename(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// Parent directory. The root is its own parent.
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self {
            scheme: self.scheme.clone(),
            segments,
        }
    }

    /// Append one or more `/`-separated components.
    pub fn join(&self, name: &str) -> VfsResult<Self> {
        let mut joined = self.segments.join("/");
        joined.push('/');
        joined.push_str(name);
        Self::from_native(self.scheme.clone(), &joined)
    }

    /// Append a single entry name. Names that are empty, `.`/`..` or contain a
    /// separator are `InvalidPath`.
    pub fn child(&self, name: &str) -> VfsResult<Self> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(VfsError::invalid_path(format!("bad entry name: {name:?}")));
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self {
            scheme: self.scheme.clone(),
            segments,
        })
    }

    /// Returns true if `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &VirtualPath) -> bool {
        self.scheme == other.scheme && self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:///{}", self.scheme, self.segments.join("/"))
    }
}

impl std::str::FromStr for VirtualPath {
    type Err = VfsError;

    fn from_str(s: &str) -> VfsResult<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = VfsError;

    fn try_from(s: String) -> VfsResult<Self> {
        Self::parse(&s)
    }
}

impl From<VirtualPath> for String {
    fn from(p: VirtualPath) -> Self {
        p.to_string()
    }
}

/// Anything a dispatcher verb accepts as a path argument.
pub trait AsVirtualPath {
    fn to_virtual_path(&self) -> VfsResult<VirtualPath>;
}

impl AsVirtualPath for str {
    fn to_virtual_path(&self) -> VfsResult<VirtualPath> {
        VirtualPath::parse(self)
    }
}

impl AsVirtualPath for String {
    fn to_virtual_path(&self) -> VfsResult<VirtualPath> {
        VirtualPath::parse(self)
    }
}

impl AsVirtualPath for VirtualPath {
    fn to_virtual_path(&self) -> VfsResult<VirtualPath> {
        Ok(self.clone())
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

fn normalize_segments(path: &str) -> Option<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s.to_string()),
        }
    }
    Some(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let p = VirtualPath::parse("home:///docs/a.txt").unwrap();
        assert_eq!(p.scheme(), "home");
        assert_eq!(p.segments(), &["docs".to_string(), "a.txt".to_string()]);
        assert_eq!(p.to_string(), "home:///docs/a.txt");
        assert_eq!(p.native(), "/docs/a.txt");
        assert_eq!(p.filename(), "a.txt");
    }

    #[test]
    fn test_root() {
        let p = VirtualPath::parse("dropbox:///").unwrap();
        assert!(p.is_root());
        assert_eq!(p.to_string(), "dropbox:///");
        assert_eq!(p.native(), "/");
        assert_eq!(p.filename(), "");
        assert_eq!(p.parent(), p);

        // Fewer slashes still parse to the same root.
        assert_eq!(VirtualPath::parse("dropbox://").unwrap(), p);
    }

    #[test]
    fn test_normalization() {
        let p = VirtualPath::parse("home:///a//b/./c/../d/").unwrap();
        assert_eq!(p.to_string(), "home:///a/b/d");
    }

    #[test]
    fn test_rejects_escape_and_bad_scheme() {
        assert!(matches!(
            VirtualPath::parse("home:///../etc/passwd"),
            Err(VfsError::InvalidPath(_))
        ));
        assert!(VirtualPath::parse("/no/scheme").is_err());
        assert!(VirtualPath::parse("://x").is_err());
        assert!(VirtualPath::parse("bad scheme:///x").is_err());
    }

    #[test]
    fn test_parent_and_join() {
        let p = VirtualPath::parse("home:///sub/file.txt").unwrap();
        assert_eq!(p.parent().to_string(), "home:///sub");
        assert_eq!(p.parent().parent().to_string(), "home:///");

        let dir = VirtualPath::parse("home:///sub").unwrap();
        assert_eq!(dir.join("x/y.txt").unwrap().to_string(), "home:///sub/x/y.txt");
        assert!(dir.join("../../x").is_err());

        assert_eq!(dir.child("a b.txt").unwrap().to_string(), "home:///sub/a b.txt");
        for bad in ["", ".", "..", "../evil.txt", "x/y", "x\\y"] {
            assert!(matches!(dir.child(bad), Err(VfsError::InvalidPath(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_from_native_and_starts_with() {
        let p = VirtualPath::from_native("dropbox", "/Photos/cat.jpg").unwrap();
        assert_eq!(p.to_string(), "dropbox:///Photos/cat.jpg");

        let dir = VirtualPath::from_native("dropbox", "/Photos").unwrap();
        assert!(p.starts_with(&dir));
        assert!(!dir.starts_with(&p));
        assert!(!p.starts_with(&VirtualPath::root("home")));
    }

    #[test]
    fn test_serde_as_string() {
        let p = VirtualPath::parse("home:///a.txt").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"home:///a.txt\"");
        let back: VirtualPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
