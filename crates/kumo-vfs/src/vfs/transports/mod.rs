//! VFS transports.
//!
//! Transports implement [`Transport`](super::Transport) for different
//! storage protocols.

mod dropbox;
mod memory;
mod osjs;
mod webdav;

pub use dropbox::{DropboxSettings, DropboxTransport, MAX_RESULTS};
pub use memory::MemoryTransport;
pub use osjs::OsjsTransport;
pub use webdav::{WebdavSettings, WebdavTransport};
