//! Base image resolution.
//!
//! A [`BaseResolver`] turns a reference into the root filesystem the first
//! layer of an image starts from. Resolution is deterministic: the same
//! reference always yields the same rootfs.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use a3s_bake_core::error::{BakeError, Result};
use async_trait::async_trait;

use crate::reference::ImageReference;
use crate::rootfs::Rootfs;

/// Source of base images.
#[async_trait]
pub trait BaseResolver: Send + Sync {
    /// Fetch the root filesystem of `reference`.
    async fn resolve(&self, reference: &ImageReference) -> Result<Rootfs>;
}

/// Parse `reference` and resolve it, failing with a timeout error once
/// `deadline` has passed.
pub async fn resolve_base(
    resolver: &dyn BaseResolver,
    reference: &str,
    deadline: Duration,
) -> Result<Rootfs> {
    let parsed = ImageReference::parse(reference)?;
    tracing::debug!(reference = %parsed, "Resolving base image");
    with_deadline(
        format!("fetching base image {}", reference),
        deadline,
        resolver.resolve(&parsed),
    )
    .await
}

/// Run a network-bound operation under a deadline.
pub async fn with_deadline<T, F>(operation: String, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation = %operation, after = ?deadline, "Operation timed out");
            Err(BakeError::Timeout {
                operation,
                after: deadline,
            })
        }
    }
}

/// In-process base images keyed by full reference.
#[derive(Debug, Default)]
pub struct MemoryBaseStore {
    images: RwLock<HashMap<String, Arc<Rootfs>>>,
}

impl MemoryBaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `rootfs` under `reference`.
    pub fn insert(&self, reference: &str, rootfs: Rootfs) -> Result<()> {
        let parsed = ImageReference::parse(reference)?;
        let mut images = self
            .images
            .write()
            .map_err(|_| resolution(&parsed, "base store lock poisoned"))?;
        images.insert(parsed.full_reference(), Arc::new(rootfs));
        Ok(())
    }

    /// Builder-style [`MemoryBaseStore::insert`].
    pub fn with_image(self, reference: &str, rootfs: Rootfs) -> Result<Self> {
        self.insert(reference, rootfs)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.images.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BaseResolver for MemoryBaseStore {
    async fn resolve(&self, reference: &ImageReference) -> Result<Rootfs> {
        let images = self
            .images
            .read()
            .map_err(|_| resolution(reference, "base store lock poisoned"))?;
        images
            .get(&reference.full_reference())
            .map(|rootfs| rootfs.as_ref().clone())
            .ok_or_else(|| resolution(reference, "image not found in base store"))
    }
}

/// Base images stored as plain directory trees under
/// `<root>/<registry>/<repository>/<tag>/`.
#[derive(Debug, Clone)]
pub struct DirBaseStore {
    root: PathBuf,
}

impl DirBaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the tree of `reference`.
    pub fn image_dir(&self, reference: &ImageReference) -> PathBuf {
        self.root.join(reference.store_path())
    }
}

#[async_trait]
impl BaseResolver for DirBaseStore {
    async fn resolve(&self, reference: &ImageReference) -> Result<Rootfs> {
        let dir = self.image_dir(reference);
        if !dir.is_dir() {
            return Err(resolution(
                reference,
                &format!("image not found in base store ({})", dir.display()),
            ));
        }

        tracing::debug!(reference = %reference, path = %dir.display(), "Loading base image from store");
        let loaded = tokio::task::spawn_blocking(move || Rootfs::from_dir(&dir))
            .await
            .map_err(|e| resolution(reference, &format!("loader task failed: {}", e)))?;
        loaded.map_err(|e| resolution(reference, &format!("failed to load image tree: {}", e)))
    }
}

pub(crate) fn resolution(reference: &ImageReference, message: &str) -> BakeError {
    BakeError::Resolution {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::DEFAULT_FILE_MODE;
    use a3s_bake_core::ErrorKind;
    use tempfile::TempDir;

    struct SlowResolver;

    #[async_trait]
    impl BaseResolver for SlowResolver {
        async fn resolve(&self, _reference: &ImageReference) -> Result<Rootfs> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Rootfs::new())
        }
    }

    fn base_rootfs() -> Rootfs {
        let mut fs = Rootfs::new();
        fs.write_file("/etc/os-release", "ID=base-os\n", DEFAULT_FILE_MODE)
            .unwrap();
        fs
    }

    #[tokio::test]
    async fn test_memory_store_resolves_short_and_full_names() {
        let store = MemoryBaseStore::new()
            .with_image("base-os:20.04", base_rootfs())
            .unwrap();

        let short = resolve_base(&store, "base-os:20.04", Duration::from_secs(5))
            .await
            .unwrap();
        let full = resolve_base(
            &store,
            "docker.io/library/base-os:20.04",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(short, full);
        assert_eq!(short.read_file("/etc/os-release").unwrap(), b"ID=base-os\n");
    }

    #[tokio::test]
    async fn test_memory_store_unknown_reference() {
        let store = MemoryBaseStore::new();
        let err = resolve_base(&store, "base-os:22.04", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[tokio::test]
    async fn test_malformed_reference_is_resolution_error() {
        let store = MemoryBaseStore::new();
        let err = resolve_base(&store, "Not A Ref", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[tokio::test]
    async fn test_dir_store_loads_tree() {
        let tmp = TempDir::new().unwrap();
        let store = DirBaseStore::new(tmp.path());
        let reference = ImageReference::parse("base-os:20.04").unwrap();
        let image_dir = store.image_dir(&reference);
        std::fs::create_dir_all(image_dir.join("etc/apache2")).unwrap();
        std::fs::write(image_dir.join("etc/apache2/ports.conf"), "Listen 80\n").unwrap();

        let rootfs = resolve_base(&store, "base-os:20.04", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            rootfs.read_file("/etc/apache2/ports.conf").unwrap(),
            b"Listen 80\n"
        );
    }

    #[tokio::test]
    async fn test_dir_store_missing_image() {
        let tmp = TempDir::new().unwrap();
        let store = DirBaseStore::new(tmp.path());
        let err = resolve_base(&store, "base-os:20.04", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found in base store"));
    }

    #[tokio::test]
    async fn test_slow_resolver_times_out() {
        let err = resolve_base(&SlowResolver, "base-os:20.04", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
