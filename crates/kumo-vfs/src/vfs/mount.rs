//! Mount point registry with scheme routing.
//!
//! Every mount point owns exactly one scheme (`home`, `dropbox`, ...). A
//! virtual path resolves to the mount point whose scheme it carries, provided
//! that mount point is enabled and mounted. Overlapping registrations (same
//! name or same scheme) are rejected, so no path can resolve two ways.
//!
//! The table is read on every request and written only on (un)registration,
//! so it is kept as a copy-on-write snapshot behind a narrow write lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use super::error::{VfsError, VfsResult};
use super::path::VirtualPath;
use super::transport::Transport;
use crate::flows::{SharedVfsFlowBus, VfsFlow, shared_vfs_flow_bus};

/// Icon used when a mount point does not name one.
pub const DEFAULT_ICON: &str = "devices/drive-harddisk.png";

/// Per-mount options.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    /// Configured on/off switch; the transport may still disable itself.
    pub enabled: bool,
    pub read_only: bool,
    pub visible: bool,
    pub searchable: bool,
    /// Special mount points never broadcast mount/unmount events.
    pub special: bool,
    /// Registered at runtime rather than from configuration.
    pub dynamic: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            title: None,
            description: None,
            icon: None,
            enabled: true,
            read_only: false,
            visible: true,
            searchable: false,
            special: false,
            dynamic: true,
        }
    }
}

/// A registered backend endpoint owning one scheme.
pub struct MountPoint {
    name: String,
    title: String,
    root: VirtualPath,
    options: MountOptions,
    transport: Arc<dyn Transport>,
    mounted: AtomicBool,
}

impl std::fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountPoint")
            .field("name", &self.name)
            .field("root", &self.root.to_string())
            .field("transport", &self.transport.kind())
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

impl MountPoint {
    /// Create a mount point. The name is normalized (whitespace to `-`,
    /// lower-cased) and becomes the scheme, so its root is `<name>:///`.
    pub fn new(
        name: &str,
        transport: Arc<dyn Transport>,
        options: MountOptions,
    ) -> VfsResult<Self> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Err(VfsError::config("mount point name is empty"));
        }
        let root = VirtualPath::parse(&format!("{normalized}:///"))
            .map_err(|_| VfsError::config(format!("invalid mount point name: {name}")))?;
        let title = options.title.clone().unwrap_or_else(|| name.to_string());

        Ok(Self {
            name: normalized,
            title,
            root,
            options,
            transport,
            mounted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn root(&self) -> &VirtualPath {
        &self.root
    }

    pub fn scheme(&self) -> &str {
        self.root.scheme()
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Configured on and the transport is usable. Evaluated on every call.
    pub fn enabled(&self) -> bool {
        self.options.enabled && self.transport.enabled()
    }

    /// Returns true if `path` belongs to this mount point.
    pub fn matches(&self, path: &VirtualPath) -> bool {
        path.scheme() == self.scheme()
    }

    pub fn info(&self) -> MountInfo {
        MountInfo {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self
                .options
                .description
                .clone()
                .unwrap_or_else(|| self.title.clone()),
            root: self.root.to_string(),
            transport: self.transport.kind().to_string(),
            icon: self
                .options
                .icon
                .clone()
                .unwrap_or_else(|| DEFAULT_ICON.to_string()),
            enabled: self.enabled(),
            mounted: self.is_mounted(),
            read_only: self.options.read_only,
            visible: self.options.visible,
            searchable: self.options.searchable,
        }
    }
}

/// Snapshot of one mount point for enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub name: String,
    pub title: String,
    pub description: String,
    pub root: String,
    pub transport: String,
    pub icon: String,
    pub enabled: bool,
    pub mounted: bool,
    pub read_only: bool,
    pub visible: bool,
    pub searchable: bool,
}

/// Routes virtual paths to mount points.
pub struct Registry {
    mounts: RwLock<Arc<Vec<Arc<MountPoint>>>>,
    flows: SharedVfsFlowBus,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("mounts", &self.mounts.read().len())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry with its own event bus.
    pub fn new() -> Self {
        Self::with_flows(shared_vfs_flow_bus(256))
    }

    /// Create an empty registry publishing to `flows`.
    pub fn with_flows(flows: SharedVfsFlowBus) -> Self {
        Self {
            mounts: RwLock::new(Arc::new(Vec::new())),
            flows,
        }
    }

    pub fn flows(&self) -> &SharedVfsFlowBus {
        &self.flows
    }

    /// Register a mount point without mounting it.
    ///
    /// Fails with `MountConflict` if the name or scheme is already taken.
    pub fn register(&self, mount: MountPoint) -> VfsResult<Arc<MountPoint>> {
        let mount = Arc::new(mount);
        let mut guard = self.mounts.write();

        if let Some(existing) = guard
            .iter()
            .find(|m| m.name == mount.name || m.scheme() == mount.scheme())
        {
            return Err(VfsError::MountConflict(format!(
                "{} overlaps registered mount point {}",
                mount.root, existing.name
            )));
        }

        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(Arc::clone(&mount));
        *guard = Arc::new(next);

        tracing::debug!(
            mount = %mount.name,
            transport = mount.transport.kind(),
            "registered mount point"
        );
        Ok(mount)
    }

    /// Mount a registered mount point.
    ///
    /// The transport is brought to readiness first; the mounted flag flips
    /// only after that succeeds.
    pub async fn mount(&self, name: &str, source: Option<String>) -> VfsResult<Arc<MountPoint>> {
        let mount = self.get(name)?;
        if mount.is_mounted() {
            return Ok(mount);
        }

        mount.transport.ready().await?;

        let was_mounted = mount.mounted.swap(true, Ordering::AcqRel);
        if !was_mounted {
            tracing::info!(mount = %mount.name, "mounted");
            if !mount.options.special {
                self.flows.publish_from(
                    VfsFlow::Mounted {
                        module: mount.name.clone(),
                    },
                    source,
                );
            }
        }
        Ok(mount)
    }

    /// Unmount a mount point and drop its transport's cached state.
    ///
    /// Returns `true` if it was mounted.
    pub async fn unmount(&self, name: &str, source: Option<String>) -> VfsResult<bool> {
        let mount = self.get(name)?;
        let was_mounted = mount.mounted.swap(false, Ordering::AcqRel);
        mount.transport.teardown().await;

        if was_mounted {
            tracing::info!(mount = %mount.name, "unmounted");
            if !mount.options.special {
                self.flows.publish_from(
                    VfsFlow::Unmounted {
                        module: mount.name.clone(),
                    },
                    source,
                );
            }
        }
        Ok(was_mounted)
    }

    /// Unmount and deregister a mount point.
    pub async fn remove(&self, name: &str, source: Option<String>) -> VfsResult<()> {
        self.unmount(name, source).await?;
        let mut guard = self.mounts.write();
        let next: Vec<_> = guard
            .iter()
            .filter(|m| m.name != name)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        Ok(())
    }

    /// Look up a mount point by name, regardless of state.
    pub fn get(&self, name: &str) -> VfsResult<Arc<MountPoint>> {
        let snapshot = self.snapshot_arc();
        snapshot
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| VfsError::no_mount(name))
    }

    /// Resolve a virtual path to its mount point.
    ///
    /// Disabled or unmounted mount points behave as if they did not exist.
    pub fn resolve(&self, path: &VirtualPath) -> VfsResult<Arc<MountPoint>> {
        let snapshot = self.snapshot_arc();
        snapshot
            .iter()
            .find(|m| m.matches(path))
            .filter(|m| m.enabled() && m.is_mounted())
            .cloned()
            .ok_or_else(|| VfsError::no_mount(path.to_string()))
    }

    /// Live snapshot of every registered mount point.
    pub fn snapshot(&self) -> Vec<MountInfo> {
        self.snapshot_arc().iter().map(|m| m.info()).collect()
    }

    /// Visible, enabled mount points, optionally only searchable ones.
    pub fn mount_points(&self, searchable_only: bool) -> Vec<MountInfo> {
        self.snapshot_arc()
            .iter()
            .filter(|m| m.enabled() && m.options.visible && !m.options.special)
            .filter(|m| !searchable_only || m.options.searchable)
            .map(|m| m.info())
            .collect()
    }

    fn snapshot_arc(&self) -> Arc<Vec<Arc<MountPoint>>> {
        Arc::clone(&self.mounts.read())
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}
