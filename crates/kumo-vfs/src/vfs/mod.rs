//! Virtual file system.
//!
//! Key components:
//!
//! - [`VirtualPath`] - Scheme-prefixed path, parsed once at the boundary
//! - [`Transport`] - Uniform verb set, one implementation per protocol
//! - [`Registry`] - Routes a path's scheme to exactly one mount point
//! - [`Dispatcher`] - Resolves, guards, invokes and notifies
//!
//! ## Design Decisions
//!
//! - **One scheme per mount point**: matching is scheme equality, and the
//!   registry refuses a second mount point for a taken scheme or name.
//! - **Typed errors at the boundary**: transports map every wire failure
//!   into [`VfsError`]; nothing protocol-specific escapes.
//! - **Lazy auth**: cloud transports sign in on first use, not at mount.

pub mod connection;
mod dispatch;
mod error;
mod mount;
mod path;
mod transport;
pub mod transports;
mod types;

pub use connection::{Connection, ConnectionSettings};
pub use dispatch::Dispatcher;
pub use error::{VfsError, VfsResult};
pub use mount::{DEFAULT_ICON, MountInfo, MountOptions, MountPoint, Registry};
pub use path::{AsVirtualPath, VirtualPath};
pub use transport::{Transport, Verb};
pub use transports::{
    DropboxSettings, DropboxTransport, MemoryTransport, OsjsTransport, WebdavSettings,
    WebdavTransport,
};
pub use types::{
    DEFAULT_MIME, FileBlob, FileMetadata, FileType, FindQuery, ScandirOptions, TransferOptions,
    UploadFile, UrlOptions, guess_mime,
};
