//! Kumo virtual file system.
//!
//! One verb set (`scandir`, `read`, `write`, `copy`, `move`, ...) over
//! backends that each speak their own protocol and authenticate on their
//! own terms:
//!
//! - **osjs**: the local server's JSON API
//! - **webdav**: any WebDAV host, directly or through the server's proxy
//! - **dropbox**: the Dropbox HTTP API behind an interactive OAuth session
//! - **memory**: in-process scratch storage
//!
//! Callers address files with scheme-prefixed virtual paths such as
//! `home:///docs/a.txt`; the [`Registry`](vfs::Registry) maps the scheme to a
//! mount point and the [`Dispatcher`](vfs::Dispatcher) runs the verb on that
//! mount point's transport.

pub mod auth;
pub mod config;
pub mod flows;
pub mod vfs;

pub use auth::{Authorizer, Credential, Session, SessionStatus};
pub use config::{MountConfig, TransportKind, VfsConfig};
pub use flows::{FlowBus, FlowMessage, SharedVfsFlowBus, Subscription, VfsFlow};
pub use vfs::{
    Dispatcher, FileBlob, FileMetadata, FileType, MountInfo, MountOptions, MountPoint, Registry,
    Transport, VfsError, VfsResult, VirtualPath,
};
