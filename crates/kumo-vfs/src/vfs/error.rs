//! VFS error types.
//!
//! Every transport maps its wire failures into [`VfsError`] before returning,
//! so callers match on the kind and never on a backend's message text.

use std::io;
use thiserror::Error;

/// VFS error type.
///
/// `Clone` so a single outcome (e.g. one interactive auth attempt) can be
/// handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VfsError {
    /// No enabled, mounted mount point owns the path's scheme.
    #[error("no mount point for path: {0}")]
    NoMount(String),

    /// The transport does not implement this verb.
    #[error("operation unavailable: {0}")]
    Unavailable(String),

    /// Payload rejected by the pre-flight size check.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    /// A body was expected but the remote sent none.
    #[error("remote returned an empty response: {0}")]
    EmptyRemote(String),

    /// The backend needs a credential that is not available.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// The interactive sign-in did not finish before the deadline.
    #[error("authentication timed out")]
    AuthTimeout,

    /// The cached credential was rejected as expired.
    #[error("authentication expired")]
    AuthExpired,

    /// The sign-in flow completed but access was denied.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Underlying protocol or network failure.
    #[error("wire error: {0}")]
    Wire(String),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// Mount point is read-only.
    #[error("mount point is read-only: {0}")]
    ReadOnly(String),

    /// Invalid virtual path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Path escapes the served root (server sandbox).
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Registration overlaps an existing mount point.
    #[error("mount point conflict: {0}")]
    MountConflict(String),

    /// Copy/move between mount points of something that cannot be streamed
    /// through read + write (e.g. a directory).
    #[error("cannot transfer across mount points: {0}")]
    CrossMount(String),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl VfsError {
    pub fn no_mount(path: impl Into<String>) -> Self {
        Self::NoMount(path.into())
    }

    pub fn unavailable(verb: impl Into<String>) -> Self {
        Self::Unavailable(verb.into())
    }

    pub fn empty_remote(what: impl Into<String>) -> Self {
        Self::EmptyRemote(what.into())
    }

    pub fn wire(msg: impl std::fmt::Display) -> Self {
        Self::Wire(msg.to_string())
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists(path.into())
    }

    pub fn read_only(mount: impl Into<String>) -> Self {
        Self::ReadOnly(mount.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable kind name, independent of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoMount(_) => "ERR_NO_MOUNT",
            Self::Unavailable(_) => "ERR_VFS_UNAVAILABLE",
            Self::TooLarge { .. } => "ERR_TOO_LARGE",
            Self::EmptyRemote(_) => "ERR_EMPTY_REMOTE",
            Self::AuthRequired(_) => "ERR_AUTH_REQUIRED",
            Self::AuthTimeout => "ERR_AUTH_TIMEOUT",
            Self::AuthExpired => "ERR_AUTH_EXPIRED",
            Self::AuthFailed(_) => "ERR_AUTH_FAILED",
            Self::Wire(_) => "ERR_WIRE",
            Self::NotFound(_) => "ERR_NOT_FOUND",
            Self::Exists(_) => "ERR_EXISTS",
            Self::ReadOnly(_) => "ERR_READ_ONLY",
            Self::InvalidPath(_) => "ERR_INVALID_PATH",
            Self::PathEscapesRoot(_) => "ERR_PATH_ESCAPES_ROOT",
            Self::MountConflict(_) => "ERR_MOUNT_CONFLICT",
            Self::CrossMount(_) => "ERR_CROSS_MOUNT",
            Self::Cancelled => "ERR_CANCELLED",
            Self::Config(_) => "ERR_CONFIG",
        }
    }

    /// Returns true for the authentication family of errors.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::AuthRequired(_) | Self::AuthTimeout | Self::AuthExpired | Self::AuthFailed(_)
        )
    }

    /// Returns true if the error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<io::Error> for VfsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            io::ErrorKind::AlreadyExists => Self::Exists(e.to_string()),
            io::ErrorKind::PermissionDenied => Self::ReadOnly(e.to_string()),
            _ => Self::Wire(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for VfsError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Wire(format!("request timed out: {e}"))
        } else {
            Self::Wire(e.to_string())
        }
    }
}

impl From<url::ParseError> for VfsError {
    fn from(e: url::ParseError) -> Self {
        Self::Config(format!("invalid url: {e}"))
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
