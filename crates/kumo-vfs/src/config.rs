//! TOML configuration and registry bootstrap.
//!
//! ```toml
//! [connection]
//! api_root = "http://localhost:8000/FS"
//! max_upload_size = 2097152
//!
//! [dropbox]
//! client_key = "..."
//!
//! [mountpoints.home]
//! transport = "osjs"
//!
//! [mountpoints.owncloud]
//! transport = "webdav"
//! host = "https://dav.example.com/remote.php/webdav/"
//! cors = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::auth::Authorizer;
use crate::vfs::{
    Connection, ConnectionSettings, DropboxSettings, DropboxTransport, MemoryTransport,
    MountOptions, MountPoint, OsjsTransport, Registry, Transport, VfsError, VfsResult,
    WebdavSettings, WebdavTransport,
};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "KUMO_CONFIG";

/// Which transport a mount point uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    Osjs,
    Webdav,
    Dropbox,
    Memory,
}

/// One `[mountpoints.<name>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub transport: TransportKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub special: bool,

    // WebDAV
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub cors: bool,
    #[serde(default)]
    pub ns: Option<String>,
}

fn default_true() -> bool {
    true
}

impl MountConfig {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            title: None,
            description: None,
            icon: None,
            enabled: true,
            read_only: false,
            visible: true,
            searchable: false,
            special: false,
            host: None,
            username: None,
            password: None,
            cors: false,
            ns: None,
        }
    }

    fn options(&self, name: &str) -> MountOptions {
        MountOptions {
            title: Some(self.title.clone().unwrap_or_else(|| name.to_string())),
            description: self.description.clone(),
            icon: self.icon.clone(),
            enabled: self.enabled,
            read_only: self.read_only,
            visible: self.visible,
            searchable: self.searchable,
            special: self.special,
            dynamic: false,
        }
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VfsConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub dropbox: DropboxSettings,
    #[serde(default)]
    pub mountpoints: BTreeMap<String, MountConfig>,
}

impl VfsConfig {
    /// `$KUMO_CONFIG`, else `<config dir>/kumo/vfs.toml`.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|p| p.join("kumo").join("vfs.toml")))
    }

    pub fn parse(text: &str) -> VfsResult<Self> {
        toml::from_str(text).map_err(|e| VfsError::config(e.to_string()))
    }

    pub async fn load(path: &Path) -> VfsResult<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| VfsError::config(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Load `path` if given, else the default location. A missing default
    /// file is an empty configuration.
    pub async fn load_or_default(path: Option<&Path>) -> VfsResult<Self> {
        if let Some(path) = path {
            return Self::load(path).await;
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path).await,
            _ => Ok(Self::default()),
        }
    }

    /// Instantiate the transport for one mount point.
    pub fn transport(
        &self,
        mount: &MountConfig,
        authorizer: &Arc<dyn Authorizer>,
    ) -> VfsResult<Arc<dyn Transport>> {
        Ok(match mount.transport {
            TransportKind::Osjs => Arc::new(OsjsTransport::new(Connection::new(&self.connection)?)),
            TransportKind::Memory => Arc::new(MemoryTransport::new()),
            TransportKind::Dropbox => Arc::new(DropboxTransport::new(
                self.dropbox.clone(),
                Arc::clone(authorizer),
            )?),
            TransportKind::Webdav => {
                let host = mount
                    .host
                    .clone()
                    .ok_or_else(|| VfsError::config("webdav mount point needs a host"))?;
                let settings = WebdavSettings {
                    host,
                    username: mount.username.clone(),
                    password: mount.password.clone(),
                    cors: mount.cors,
                    ns: mount.ns.clone(),
                };
                Arc::new(WebdavTransport::new(
                    settings,
                    Connection::new(&self.connection)?,
                )?)
            }
        })
    }

    /// Register and mount every configured mount point.
    ///
    /// A mount point that fails to register or mount is logged and skipped;
    /// one bad entry never prevents the rest from coming up.
    pub async fn build_registry(&self, authorizer: Arc<dyn Authorizer>) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());

        for (name, mount) in &self.mountpoints {
            if !mount.enabled {
                tracing::debug!(mount = %name, "mount point disabled in config");
                continue;
            }

            let registered = self
                .transport(mount, &authorizer)
                .and_then(|t| MountPoint::new(name, t, mount.options(name)))
                .and_then(|m| registry.register(m));
            let registered = match registered {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(mount = %name, error = %e, "skipping mount point");
                    continue;
                }
            };

            if !registered.enabled() {
                tracing::info!(
                    mount = %name,
                    transport = %mount.transport,
                    "mount point registered but unavailable"
                );
                continue;
            }
            if let Err(e) = registry.mount(registered.name(), None).await {
                tracing::warn!(mount = %name, error = %e, "mount failed");
            }
        }

        registry
    }
}
