//! Request dispatcher.
//!
//! Resolves a virtual path to its mount point, applies the mount-level
//! guards (read-only, overwrite), invokes the transport, and publishes a
//! change notification once a mutation has succeeded. No retries happen
//! here; callers retry if they want to.

use std::future::Future;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio_util::sync::CancellationToken;

use super::error::{VfsError, VfsResult};
use super::mount::{MountInfo, MountPoint, Registry};
use super::path::{AsVirtualPath, VirtualPath};
use super::transport::Verb;
use super::types::{
    DEFAULT_MIME, FileBlob, FileMetadata, FindQuery, ScandirOptions, TransferOptions, UploadFile,
    UrlOptions,
};
use crate::flows::{Subscription, VfsFlow};

/// Cheap-to-clone handle for issuing VFS verbs.
///
/// A dispatcher carries an optional source name (reported as the sender of
/// the events it causes) and a cancellation token shared by every request
/// made through it.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    source: Option<String>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("source", &self.source)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            source: None,
            cancel: CancellationToken::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Report `source` as the sender of events caused through this handle.
    pub fn with_source(self, source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..self
        }
    }

    /// Abort in-flight and future requests when `token` is cancelled.
    pub fn with_cancel(self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription<VfsFlow> {
        self.registry.flows().subscribe(pattern)
    }

    // ========================================================================
    // Mount lifecycle
    // ========================================================================

    pub async fn mount(&self, name: &str) -> VfsResult<Arc<MountPoint>> {
        self.guarded(self.registry.mount(name, self.source.clone()))
            .await
    }

    pub async fn unmount(&self, name: &str) -> VfsResult<bool> {
        self.registry.unmount(name, self.source.clone()).await
    }

    /// End the backend session of `name` and unmount it, so later requests
    /// fail with `NoMount` instead of reaching a signed-out transport. The
    /// mount is unmounted even when the backend sign-out fails; that error is
    /// returned afterwards.
    pub async fn sign_out(&self, name: &str) -> VfsResult<()> {
        let mount = self.registry.get(name)?;
        let signed_out = mount.transport().sign_out().await;
        if let Err(e) = &signed_out {
            tracing::warn!(mount = name, error = %e, "backend sign-out failed");
        }
        self.registry.unmount(name, self.source.clone()).await?;
        signed_out
    }

    /// Live snapshot of every registered mount point.
    pub fn snapshot(&self) -> Vec<MountInfo> {
        self.registry.snapshot()
    }

    pub fn mount_points(&self, searchable_only: bool) -> Vec<MountInfo> {
        self.registry.mount_points(searchable_only)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Immediate children of `dir`, with a `..` entry below the mount root.
    pub async fn scandir<P>(&self, dir: &P, opts: &ScandirOptions) -> VfsResult<Vec<FileMetadata>>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, dir) = self.resolve(dir, Verb::Scandir)?;
        let mut entries = self.guarded(mount.transport().scandir(&dir)).await?;

        if !opts.backlink {
            entries.retain(|e| !e.is_backlink());
        } else if !dir.is_root() && !entries.iter().any(FileMetadata::is_backlink) {
            entries.insert(0, FileMetadata::backlink(dir.parent()));
        }
        entries.retain(|e| opts.accepts(e));
        Ok(entries)
    }

    pub async fn read<P>(&self, file: &P) -> VfsResult<FileBlob>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, file) = self.resolve(file, Verb::Read)?;
        self.guarded(mount.transport().read(&file)).await
    }

    pub async fn exists<P>(&self, file: &P) -> VfsResult<bool>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, file) = self.resolve(file, Verb::Exists)?;
        self.guarded(mount.transport().exists(&file)).await
    }

    pub async fn fileinfo<P>(&self, file: &P) -> VfsResult<FileMetadata>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, file) = self.resolve(file, Verb::Fileinfo)?;
        self.guarded(mount.transport().fileinfo(&file)).await
    }

    pub async fn find<P>(&self, dir: &P, query: &FindQuery) -> VfsResult<Vec<FileMetadata>>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, dir) = self.resolve(dir, Verb::Find)?;
        self.guarded(mount.transport().find(&dir, query)).await
    }

    pub async fn url<P>(&self, file: &P, opts: &UrlOptions) -> VfsResult<String>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, file) = self.resolve(file, Verb::Url)?;
        self.guarded(mount.transport().url(&file, opts)).await
    }

    /// Free bytes on the mount owning `root`, or -1 when unknown.
    pub async fn free_space<P>(&self, root: &P) -> VfsResult<i64>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, root) = self.resolve(root, Verb::FreeSpace)?;
        self.guarded(async { Ok::<_, VfsError>(mount.transport().free_space(&root).await) })
            .await
    }

    /// Fetch the contents behind `url(file)`.
    pub async fn download<P>(&self, file: &P) -> VfsResult<FileBlob>
    where
        P: AsVirtualPath + ?Sized,
    {
        let file = file.to_virtual_path()?;
        let url = self.url(&file, &UrlOptions { dl: Some(1) }).await?;

        if let Some(data_uri) = url.strip_prefix("data:") {
            return decode_data_uri(data_uri);
        }

        self.guarded(async {
            let response = self.http.get(&url).send().await?;
            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(VfsError::not_found(file.to_string()));
            }
            if !status.is_success() {
                return Err(VfsError::wire(format!("download of {file} returned HTTP {status}")));
            }
            let mime = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let data = response.bytes().await?;
            Ok::<_, VfsError>(match mime {
                Some(mime) => FileBlob::new(data, mime),
                None => FileBlob::guessed(data, file.filename()),
            })
        })
        .await
    }

    // ========================================================================
    // Writing
    // ========================================================================

    pub async fn write<P>(&self, file: &P, blob: FileBlob) -> VfsResult<FileMetadata>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, file) = self.resolve(file, Verb::Write)?;
        Self::writable(&mount)?;

        let written = FileMetadata::file(file.clone(), blob.len() as u64, Some(blob.mime.clone()));
        self.guarded(mount.transport().write(&file, blob)).await?;

        self.notify(VfsFlow::Written {
            file: written.clone(),
        });
        Ok(written)
    }

    pub async fn upload<P>(
        &self,
        dir: &P,
        file: UploadFile,
        opts: TransferOptions,
    ) -> VfsResult<FileMetadata>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, dir) = self.resolve(dir, Verb::Upload)?;
        Self::writable(&mount)?;
        let target = dir.child(&file.filename)?;
        if !opts.overwrite {
            self.ensure_absent(&mount, &target).await?;
        }

        let uploaded = self.guarded(mount.transport().upload(&dir, file)).await?;
        self.notify(VfsFlow::Uploaded {
            file: uploaded.clone(),
        });
        Ok(uploaded)
    }

    /// Create a directory. Without `overwrite`, an existing target is `Exists`.
    pub async fn mkdir<P>(&self, dir: &P, opts: TransferOptions) -> VfsResult<FileMetadata>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, dir) = self.resolve(dir, Verb::Mkdir)?;
        Self::writable(&mount)?;
        if !opts.overwrite {
            self.ensure_absent(&mount, &dir).await?;
        }

        self.guarded(mount.transport().mkdir(&dir)).await?;
        let created = FileMetadata::dir(dir);
        self.notify(VfsFlow::DirCreated {
            dir: created.clone(),
        });
        Ok(created)
    }

    pub async fn unlink<P>(&self, file: &P) -> VfsResult<()>
    where
        P: AsVirtualPath + ?Sized,
    {
        let (mount, file) = self.resolve(file, Verb::Unlink)?;
        Self::writable(&mount)?;

        let removed = self.describe(&mount, &file).await?;
        self.guarded(mount.transport().unlink(&file)).await?;
        self.notify(VfsFlow::Unlinked { file: removed });
        Ok(())
    }

    pub async fn copy<S, D>(
        &self,
        src: &S,
        dst: &D,
        opts: TransferOptions,
    ) -> VfsResult<FileMetadata>
    where
        S: AsVirtualPath + ?Sized,
        D: AsVirtualPath + ?Sized,
    {
        let (from, src) = self.resolve(src, Verb::Copy)?;
        let (to, dst) = self.resolve(dst, Verb::Copy)?;
        Self::writable(&to)?;
        if !opts.overwrite {
            self.ensure_absent(&to, &dst).await?;
        }

        let source = self.describe(&from, &src).await?;
        if Arc::ptr_eq(&from, &to) {
            self.guarded(from.transport().copy(&src, &dst)).await?;
        } else {
            self.transfer(&from, &to, &source, &dst).await?;
        }

        let destination = source.relocated(dst);
        self.notify(VfsFlow::Copied {
            source,
            destination: destination.clone(),
        });
        Ok(destination)
    }

    /// The `move` verb.
    pub async fn rename<S, D>(
        &self,
        src: &S,
        dst: &D,
        opts: TransferOptions,
    ) -> VfsResult<FileMetadata>
    where
        S: AsVirtualPath + ?Sized,
        D: AsVirtualPath + ?Sized,
    {
        let (from, src) = self.resolve(src, Verb::Move)?;
        let (to, dst) = self.resolve(dst, Verb::Move)?;
        Self::writable(&from)?;
        Self::writable(&to)?;
        if !opts.overwrite {
            self.ensure_absent(&to, &dst).await?;
        }

        let source = self.describe(&from, &src).await?;
        if Arc::ptr_eq(&from, &to) {
            self.guarded(from.transport().rename(&src, &dst)).await?;
        } else {
            self.transfer(&from, &to, &source, &dst).await?;
            self.guarded(from.transport().unlink(&src)).await?;
        }

        let destination = source.relocated(dst);
        self.notify(VfsFlow::Moved {
            source,
            destination: destination.clone(),
        });
        Ok(destination)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn resolve<P>(&self, path: &P, verb: Verb) -> VfsResult<(Arc<MountPoint>, VirtualPath)>
    where
        P: AsVirtualPath + ?Sized,
    {
        let path = path.to_virtual_path()?;
        let mount = self.registry.resolve(&path)?;
        tracing::debug!(mount = mount.name(), verb = %verb, path = %path, "dispatch");
        Ok((mount, path))
    }

    fn writable(mount: &MountPoint) -> VfsResult<()> {
        if mount.is_read_only() {
            return Err(VfsError::read_only(mount.name()));
        }
        Ok(())
    }

    async fn ensure_absent(&self, mount: &MountPoint, path: &VirtualPath) -> VfsResult<()> {
        if self.guarded(mount.transport().exists(path)).await? {
            return Err(VfsError::exists(path.to_string()));
        }
        Ok(())
    }

    /// Metadata for an entry about to be copied, moved or removed.
    ///
    /// Transports without `fileinfo` get a plain file description.
    async fn describe(&self, mount: &MountPoint, path: &VirtualPath) -> VfsResult<FileMetadata> {
        match self.guarded(mount.transport().fileinfo(path)).await {
            Ok(info) => Ok(info),
            Err(VfsError::Unavailable(_)) => Ok(FileMetadata::file(path.clone(), 0, None)),
            Err(e) => Err(e),
        }
    }

    /// Stream a file between two mount points.
    async fn transfer(
        &self,
        from: &MountPoint,
        to: &MountPoint,
        source: &FileMetadata,
        dst: &VirtualPath,
    ) -> VfsResult<()> {
        if source.is_dir() {
            return Err(VfsError::CrossMount(format!(
                "{} is a directory ({} -> {})",
                source.path,
                from.name(),
                to.name()
            )));
        }
        let blob = self.guarded(from.transport().read(&source.path)).await?;
        self.guarded(to.transport().write(dst, blob)).await
    }

    fn notify(&self, event: VfsFlow) {
        self.registry
            .flows()
            .publish_from(event, self.source.clone());
    }

    /// Race `fut` against this handle's cancellation token.
    async fn guarded<T, F>(&self, fut: F) -> VfsResult<T>
    where
        F: Future<Output = VfsResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(VfsError::Cancelled),
            result = fut => result,
        }
    }
}

/// Decode the part of a `data:` URI after the scheme.
fn decode_data_uri(uri: &str) -> VfsResult<FileBlob> {
    let (header, payload) = uri
        .split_once(',')
        .ok_or_else(|| VfsError::wire("malformed data URI"))?;
    let (mime, base64) = match header.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (header, false),
    };
    let mime = if mime.is_empty() { DEFAULT_MIME } else { mime };

    let data = if base64 {
        STANDARD
            .decode(payload)
            .map_err(|e| VfsError::wire(format!("malformed data URI: {e}")))?
    } else {
        percent_encoding::percent_decode_str(payload).collect()
    };
    Ok(FileBlob::new(data, mime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::mount::MountOptions;
    use crate::vfs::transport::Transport;
    use crate::vfs::transports::MemoryTransport;
    use async_trait::async_trait;

    async fn setup() -> Dispatcher {
        let registry = Arc::new(Registry::new());
        for (name, read_only) in [("home", false), ("scratch", false), ("system", true)] {
            let opts = MountOptions {
                read_only,
                ..Default::default()
            };
            registry
                .register(MountPoint::new(name, Arc::new(MemoryTransport::new()), opts).unwrap())
                .unwrap();
            registry.mount(name, None).await.unwrap();
        }
        Dispatcher::new(registry)
    }

    fn text(s: &'static str) -> FileBlob {
        FileBlob::new(s, "text/plain")
    }

    #[tokio::test]
    async fn test_scandir_backlink_only_below_root() {
        let vfs = setup().await;
        assert!(vfs
            .scandir("home:///", &ScandirOptions::default())
            .await
            .unwrap()
            .is_empty());

        vfs.mkdir("home:///sub", TransferOptions::default())
            .await
            .unwrap();
        vfs.write("home:///sub/a.txt", text("a")).await.unwrap();

        let listing = vfs
            .scandir("home:///sub", &ScandirOptions::default())
            .await
            .unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing[0].is_backlink());
        assert_eq!(listing[0].path.to_string(), "home:///");
        assert_eq!(listing[1].filename, "a.txt");

        let raw = vfs
            .scandir("home:///sub", &ScandirOptions::raw())
            .await
            .unwrap();
        assert_eq!(raw.len(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_and_no_mount() {
        let vfs = setup().await;
        vfs.write("home:///f.bin", FileBlob::new(vec![0u8, 1, 2, 255], DEFAULT_MIME))
            .await
            .unwrap();
        let blob = vfs.read("home:///f.bin").await.unwrap();
        assert_eq!(&blob.data[..], &[0u8, 1, 2, 255]);

        assert!(matches!(
            vfs.read("nowhere:///f.bin").await,
            Err(VfsError::NoMount(_))
        ));
        assert!(matches!(
            vfs.read("not a path").await,
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_mkdir_twice_is_exists() {
        let vfs = setup().await;
        vfs.mkdir("home:///d", TransferOptions::default())
            .await
            .unwrap();
        vfs.write("home:///d/keep.txt", text("keep")).await.unwrap();

        assert!(matches!(
            vfs.mkdir("home:///d", TransferOptions::default()).await,
            Err(VfsError::Exists(_))
        ));
        // The existing directory is untouched.
        assert!(vfs.exists("home:///d/keep.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_only_rejected_before_transport() {
        let vfs = setup().await;
        assert!(matches!(
            vfs.write("system:///x", text("x")).await,
            Err(VfsError::ReadOnly(_))
        ));
        assert!(matches!(
            vfs.mkdir("system:///d", TransferOptions::default()).await,
            Err(VfsError::ReadOnly(_))
        ));

        // Copying out of a read-only mount is fine; into it is not.
        vfs.write("home:///a.txt", text("a")).await.unwrap();
        assert!(matches!(
            vfs.copy("home:///a.txt", "system:///a.txt", TransferOptions::default())
                .await,
            Err(VfsError::ReadOnly(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_guard() {
        let vfs = setup().await;
        vfs.write("home:///a.txt", text("a")).await.unwrap();
        vfs.write("home:///b.txt", text("b")).await.unwrap();

        assert!(matches!(
            vfs.copy("home:///a.txt", "home:///b.txt", TransferOptions::default())
                .await,
            Err(VfsError::Exists(_))
        ));
        vfs.copy("home:///a.txt", "home:///b.txt", TransferOptions::overwrite())
            .await
            .unwrap();
        assert_eq!(&vfs.read("home:///b.txt").await.unwrap().data[..], b"a");
    }

    #[tokio::test]
    async fn test_cross_mount_copy_and_move() {
        let vfs = setup().await;
        vfs.write("home:///a.txt", text("hello")).await.unwrap();

        let copied = vfs
            .copy("home:///a.txt", "scratch:///a.txt", TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(copied.path.to_string(), "scratch:///a.txt");
        assert_eq!(&vfs.read("scratch:///a.txt").await.unwrap().data[..], b"hello");

        vfs.rename("scratch:///a.txt", "home:///moved.txt", TransferOptions::default())
            .await
            .unwrap();
        assert!(!vfs.exists("scratch:///a.txt").await.unwrap());
        assert!(vfs.exists("home:///moved.txt").await.unwrap());

        vfs.mkdir("home:///dir", TransferOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            vfs.copy("home:///dir", "scratch:///dir", TransferOptions::default())
                .await,
            Err(VfsError::CrossMount(_))
        ));
    }

    #[tokio::test]
    async fn test_events_carry_source() {
        let vfs = setup().await.with_source("editor");
        let mut events = vfs.subscribe("vfs.*");

        vfs.write("home:///a.txt", text("a")).await.unwrap();
        vfs.mkdir("home:///d", TransferOptions::default())
            .await
            .unwrap();
        vfs.unlink("home:///a.txt").await.unwrap();

        let subjects: Vec<_> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|m| {
            assert_eq!(m.sender.as_deref(), Some("editor"));
            m.subject
        })
        .collect();
        assert_eq!(subjects, vec!["vfs.write", "vfs.mkdir", "vfs.unlink"]);

        // Failed mutations publish nothing.
        let _ = vfs.unlink("home:///missing").await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cancellation() {
        struct Hang;

        #[async_trait]
        impl Transport for Hang {
            fn kind(&self) -> &'static str {
                "hang"
            }

            async fn read(&self, _file: &VirtualPath) -> VfsResult<FileBlob> {
                futures::future::pending().await
            }
        }

        let registry = Arc::new(Registry::new());
        registry
            .register(MountPoint::new("slow", Arc::new(Hang), MountOptions::default()).unwrap())
            .unwrap();
        registry.mount("slow", None).await.unwrap();

        let token = CancellationToken::new();
        let vfs = Dispatcher::new(registry).with_cancel(token.clone());
        let pending = tokio::spawn({
            let vfs = vfs.clone();
            async move { vfs.read("slow:///x").await }
        });
        token.cancel();
        assert_eq!(pending.await.unwrap(), Err(VfsError::Cancelled));
    }

    #[tokio::test]
    async fn test_upload_rejects_escaping_filename() {
        let vfs = setup().await;
        vfs.mkdir("home:///sub", TransferOptions::default())
            .await
            .unwrap();

        for name in ["../evil.txt", "x/evil.txt", ".."] {
            let file = UploadFile::new(name, text("evil"));
            assert!(matches!(
                vfs.upload("home:///sub", file, TransferOptions::overwrite()).await,
                Err(VfsError::InvalidPath(_))
            ));
        }
        assert!(!vfs.exists("home:///evil.txt").await.unwrap());
        assert!(!vfs.exists("home:///sub/x").await.unwrap());

        let file = UploadFile::new("ok.txt", text("ok"));
        let uploaded = vfs
            .upload("home:///sub", file, TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(uploaded.path.to_string(), "home:///sub/ok.txt");
        assert_eq!(uploaded.filename, "ok.txt");
    }

    #[tokio::test]
    async fn test_failed_sign_out_still_unmounts() {
        struct Stubborn;

        #[async_trait]
        impl Transport for Stubborn {
            fn kind(&self) -> &'static str {
                "stubborn"
            }

            async fn read(&self, _file: &VirtualPath) -> VfsResult<FileBlob> {
                Ok(FileBlob::new("x", DEFAULT_MIME))
            }

            async fn sign_out(&self) -> VfsResult<()> {
                Err(VfsError::wire("revoke refused"))
            }
        }

        let registry = Arc::new(Registry::new());
        let mount = MountPoint::new("cloud", Arc::new(Stubborn), MountOptions::default()).unwrap();
        registry.register(mount).unwrap();
        registry.mount("cloud", None).await.unwrap();
        let vfs = Dispatcher::new(registry);
        vfs.read("cloud:///a").await.unwrap();

        assert_eq!(vfs.sign_out("cloud").await, Err(VfsError::wire("revoke refused")));
        assert!(matches!(vfs.read("cloud:///a").await, Err(VfsError::NoMount(_))));
        assert!(!vfs.snapshot()[0].mounted);
    }

    #[tokio::test]
    async fn test_download_data_uri() {
        let vfs = setup().await;
        vfs.write("home:///a.txt", text("hello")).await.unwrap();
        let blob = vfs.download("home:///a.txt").await.unwrap();
        assert_eq!(&blob.data[..], b"hello");
        assert_eq!(blob.mime, "text/plain");
    }

    #[test]
    fn test_decode_plain_data_uri() {
        let blob = decode_data_uri(",a%20b").unwrap();
        assert_eq!(&blob.data[..], b"a b");
        assert_eq!(blob.mime, DEFAULT_MIME);
    }
}
