//! The composite filesystem: a base filesystem with containers opened in place.
//!
//! Every request is resolved against the [`ProviderRegistry`]. Paths without a container segment
//! go straight to the base filesystem. Paths through a container are served by that container's
//! view, which is looked up in (or added to) the [`ViewCache`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::error::FsError;
use crate::fs::tracked_file::TrackedFile;
use crate::fs::view_cache::{CacheError, ViewCache, ViewCacheConfig};
use crate::fs::{DirEntry, Metadata, ReadOnlyFs, VfsFile, ViewProvider, read_all};
use crate::path::{self, MountPath, Resolution, VfsPath};
use crate::registry::{ProviderRegistry, RegistryError};

/// A read-only filesystem that looks into archives.
///
/// `DeepFs` is itself a [`ReadOnlyFs`], so a provider may wrap one of its views in another
/// `DeepFs` to look into archives nested inside archives.
pub struct DeepFs {
    base: Arc<dyn ReadOnlyFs>,
    registry: Arc<ProviderRegistry>,
    cache: ViewCache,
}

impl DeepFs {
    /// Build a filesystem over `base`.
    ///
    /// Spawns the view cache's eviction worker, so this must be called from within a tokio
    /// runtime.
    #[must_use]
    pub fn new(
        base: Arc<dyn ReadOnlyFs>,
        registry: ProviderRegistry,
        config: ViewCacheConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let cache = ViewCache::new(Arc::clone(&base), Arc::clone(&registry), config);
        Self {
            base,
            registry,
            cache,
        }
    }

    /// Start configuring a filesystem over `base`.
    #[must_use]
    pub fn builder(base: Arc<dyn ReadOnlyFs>) -> DeepFsBuilder {
        DeepFsBuilder {
            base,
            providers: Vec::new(),
            config: ViewCacheConfig::default(),
        }
    }

    /// Split `path` at its first container boundary.
    ///
    /// `Ok(None)` means the path lives entirely in the base filesystem.
    pub fn resolve(&self, path: &str) -> Result<Option<Resolution>, FsError> {
        let path = VfsPath::parse(path)?;
        Ok(path::resolve(&self.registry, &path))
    }

    /// Open the file or directory at `path`.
    ///
    /// A handle opened inside a container keeps that container's view cached until it is closed
    /// or dropped.
    #[instrument(name = "DeepFs::open", skip(self))]
    pub async fn open(&self, path: &str) -> Result<Box<dyn VfsFile>, FsError> {
        Ok(self.open_in(path).await?.0)
    }

    /// Like [`open`](Self::open), also returning the container the handle lives in.
    async fn open_in(
        &self,
        path: &str,
    ) -> Result<(Box<dyn VfsFile>, Option<MountPath>), FsError> {
        let vpath = VfsPath::parse(path)?;
        let Some(res) = path::resolve(&self.registry, &vpath) else {
            let file = self
                .base
                .open(&vpath)
                .await
                .map_err(|source| FsError::Base {
                    path: path.to_owned(),
                    source,
                })?;
            return Ok((file, None));
        };
        debug!(mount = %res.mount, inner = %res.inner, "resolved container boundary");

        let lease = self
            .cache
            .lease(&res.mount, &res.extension)
            .await
            .map_err(|e| cache_error(path, &res, e))?;

        // On failure the lease is dropped here, which releases it again.
        let file = lease
            .view()
            .view()
            .open(&res.inner)
            .await
            .map_err(|source| FsError::Container {
                path: path.to_owned(),
                mount: res.mount.clone(),
                source,
            })?;

        let file: Box<dyn VfsFile> = Box::new(TrackedFile::new(file, lease));
        Ok((file, Some(res.mount)))
    }

    /// List the directory at `path`.
    ///
    /// Listing does not pin the view: the entries are fully materialized before this returns. A
    /// listing cut short by the view's eviction is retried against a fresh view.
    #[instrument(name = "DeepFs::read_dir", skip(self))]
    pub async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let vpath = VfsPath::parse(path)?;
        let Some(res) = path::resolve(&self.registry, &vpath) else {
            return self
                .base
                .read_dir(&vpath)
                .await
                .map_err(|source| FsError::Base {
                    path: path.to_owned(),
                    source,
                });
        };
        debug!(mount = %res.mount, inner = %res.inner, "resolved container boundary");

        loop {
            let view = self
                .cache
                .get_or_create(&res.mount, &res.extension)
                .await
                .map_err(|e| cache_error(path, &res, e))?;

            let source = match view.view().read_dir(&res.inner).await {
                Ok(entries) => return Ok(entries),
                Err(source) => source,
            };
            if !view.was_evicted().await {
                return Err(FsError::Container {
                    path: path.to_owned(),
                    mount: res.mount,
                    source,
                });
            }
            debug!(mount = %res.mount, error = %source, "view closed during listing, retrying");
        }
    }

    /// Metadata of the entry at `path`.
    pub async fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        let (file, mount) = self.open_in(path).await?;
        let stat = file.stat().await;
        let closed = file.close().await;
        let stat = stat.map_err(|source| handle_error(path, mount.as_ref(), source))?;
        closed.map_err(|source| handle_error(path, mount.as_ref(), source))?;
        Ok(stat)
    }

    /// The whole contents of the file at `path`.
    pub async fn read(&self, path: &str) -> Result<Bytes, FsError> {
        let (file, mount) = self.open_in(path).await?;
        let data = read_all(file.as_ref()).await;
        let closed = file.close().await;
        let data = data.map_err(|source| handle_error(path, mount.as_ref(), source))?;
        closed.map_err(|source| handle_error(path, mount.as_ref(), source))?;
        Ok(data)
    }

    /// The cache of open container views.
    #[must_use]
    pub fn view_cache(&self) -> &ViewCache {
        &self.cache
    }

    /// The providers this filesystem resolves containers with.
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for DeepFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepFs")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReadOnlyFs for DeepFs {
    async fn open(&self, path: &VfsPath) -> io::Result<Box<dyn VfsFile>> {
        Ok(Self::open(self, path.as_str()).await?)
    }

    async fn read_dir(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        Ok(Self::read_dir(self, path.as_str()).await?)
    }
}

fn cache_error(path: &str, res: &Resolution, e: CacheError) -> FsError {
    match e {
        CacheError::ProviderNotFound(extension) => FsError::ProviderNotFound {
            path: path.to_owned(),
            extension,
        },
        CacheError::Creation(source) => FsError::ProviderCreation {
            path: path.to_owned(),
            mount: res.mount.clone(),
            source,
        },
    }
}

/// Errors from an already open handle, attributed to the container it was opened in, if any.
fn handle_error(path: &str, mount: Option<&MountPath>, source: io::Error) -> FsError {
    match mount {
        Some(mount) => FsError::Container {
            path: path.to_owned(),
            mount: mount.clone(),
            source,
        },
        None => FsError::Base {
            path: path.to_owned(),
            source,
        },
    }
}

/// Configures and builds a [`DeepFs`].
pub struct DeepFsBuilder {
    base: Arc<dyn ReadOnlyFs>,
    providers: Vec<(Option<String>, Arc<dyn ViewProvider>)>,
    config: ViewCacheConfig,
}

impl DeepFsBuilder {
    /// Register `provider` under the extension it reports.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ViewProvider>) -> Self {
        self.providers.push((None, provider));
        self
    }

    /// Register `provider` under `extension`, overriding the extension it reports.
    #[must_use]
    pub fn provider_for(mut self, extension: &str, provider: Arc<dyn ViewProvider>) -> Self {
        self.providers.push((Some(extension.to_owned()), provider));
        self
    }

    /// Maximum number of cached views.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// How long a view stays cached after it was created.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// How often expired views are swept. Zero disables the sweep; expired views are then only
    /// retired when a request touches them.
    #[must_use]
    pub fn sweep_interval(mut self, every: Duration) -> Self {
        self.config.sweep_interval = every;
        self
    }

    /// Replace every cache setting at once.
    #[must_use]
    pub fn config(mut self, config: ViewCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the filesystem. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<DeepFs, RegistryError> {
        let mut registry = ProviderRegistry::new();
        for (extension, provider) in self.providers {
            let extension = extension.unwrap_or_else(|| provider.extension().to_owned());
            registry.register(&extension, provider)?;
        }
        Ok(DeepFs::new(self.base, registry, self.config))
    }
}

impl std::fmt::Debug for DeepFsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepFsBuilder")
            .field("providers", &self.providers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
