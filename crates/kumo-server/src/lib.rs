//! Kumo server library
//!
//! HTTP JSON API over sandboxed local directories, spoken by the `osjs`
//! transport (and relayed through by non-CORS `webdav` mounts).

pub mod api;
pub mod fs;

use std::path::PathBuf;
use std::sync::Arc;

use kumo_vfs::{Dispatcher, MountOptions, MountPoint, Registry, VfsResult};
use tokio::net::TcpListener;

pub use api::{ApiError, AppState, router};
pub use fs::LocalTransport;

/// Default API root path.
pub const DEFAULT_API_ROOT: &str = "/FS";

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path prefix for every endpoint.
    pub api_root: String,
    /// 0 means unlimited.
    pub max_upload_size: u64,
    /// `(mount name, directory)` pairs to serve.
    pub mounts: Vec<(String, PathBuf)>,
}

impl ServerConfig {
    /// Serve `root` as the `home` mount.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            api_root: DEFAULT_API_ROOT.to_string(),
            max_upload_size: 0,
            mounts: vec![("home".to_string(), root.into())],
        }
    }

    pub fn with_mount(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.mounts.push((name.into(), root.into()));
        self
    }

    pub fn with_max_upload_size(self, max_upload_size: u64) -> Self {
        Self {
            max_upload_size,
            ..self
        }
    }

    /// Register and mount one local transport per configured directory.
    pub async fn registry(&self) -> VfsResult<Arc<Registry>> {
        let registry = Arc::new(Registry::new());
        for (name, root) in &self.mounts {
            let transport = Arc::new(LocalTransport::new(root));
            tracing::info!(mount = %name, root = %transport.root().display(), "serving directory");
            let mount = MountPoint::new(
                name,
                transport,
                MountOptions {
                    dynamic: false,
                    ..Default::default()
                },
            )?;
            let mount = registry.register(mount)?;
            registry.mount(mount.name(), None).await?;
        }
        Ok(registry)
    }

    /// Build the router for this configuration.
    pub async fn app(&self) -> VfsResult<axum::Router> {
        let vfs = Dispatcher::new(self.registry().await?).with_source("kumo-server");
        let state = AppState::new(vfs, self.max_upload_size);
        Ok(router(state, &self.api_root))
    }
}

/// Serve `config` on an already-bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, config: &ServerConfig) -> VfsResult<()> {
    let app = config.app().await?;
    tracing::info!(addr = %listener.local_addr()?, api_root = %config.api_root, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
