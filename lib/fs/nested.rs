//! Containers inside containers.
//!
//! The facade only resolves the first container boundary of a path. [`Nested`] wraps a provider
//! so that each of its views is served through a [`DeepFs`] of its own, which resolves the next
//! boundary inside the container.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::fs::deep::DeepFs;
use crate::fs::view_cache::ViewCacheConfig;
use crate::fs::{ContainerView, DirEntry, ReadOnlyFs, VfsFile, ViewProvider};
use crate::path::{MountPath, VfsPath};
use crate::registry::ProviderRegistry;

/// A provider whose views look into the archives they contain, using `registry`.
pub struct Nested {
    inner: Arc<dyn ViewProvider>,
    registry: ProviderRegistry,
    config: ViewCacheConfig,
}

impl Nested {
    /// Wrap `inner`, resolving containers inside its views with `registry`.
    #[must_use]
    pub fn new(inner: Arc<dyn ViewProvider>, registry: ProviderRegistry) -> Self {
        Self {
            inner,
            registry,
            config: ViewCacheConfig::default(),
        }
    }

    /// Cache settings for the per-container filesystems.
    #[must_use]
    pub fn with_config(mut self, config: ViewCacheConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl ViewProvider for Nested {
    fn extension(&self) -> &str {
        self.inner.extension()
    }

    async fn create_view(
        &self,
        parent: Arc<dyn ReadOnlyFs>,
        mount: &MountPath,
    ) -> io::Result<Arc<dyn ContainerView>> {
        let view = self.inner.create_view(parent, mount).await?;
        let base: Arc<dyn ReadOnlyFs> = view.clone();
        Ok(Arc::new(NestedView {
            mount: mount.clone(),
            fs: DeepFs::new(base, self.registry.clone(), self.config),
            view,
        }))
    }
}

impl std::fmt::Debug for Nested {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nested")
            .field("extension", &self.inner.extension())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

struct NestedView {
    mount: MountPath,
    fs: DeepFs,
    view: Arc<dyn ContainerView>,
}

#[async_trait]
impl ReadOnlyFs for NestedView {
    async fn open(&self, path: &VfsPath) -> io::Result<Box<dyn VfsFile>> {
        ReadOnlyFs::open(&self.fs, path).await
    }

    async fn read_dir(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        ReadOnlyFs::read_dir(&self.fs, path).await
    }
}

#[async_trait]
impl ContainerView for NestedView {
    async fn close(&self) -> io::Result<()> {
        if !self.fs.view_cache().purge() {
            debug!(mount = %self.mount, "eviction channel full, dropping inner views unclosed");
        }
        self.view.close().await
    }
}
