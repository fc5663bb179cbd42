//! Open-file handles that keep their container view alive.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::fs::view_cache::ViewLease;
use crate::fs::{DirEntry, Metadata, VfsFile};
use crate::path::MountPath;

/// A handle opened inside a container.
///
/// Holds a [`ViewLease`], so the view it was opened from cannot be evicted while the handle is
/// open. [`close`](VfsFile::close) gives the lease back exactly once, then closes the wrapped
/// handle. Dropping an unclosed handle gives the lease back as well.
pub struct TrackedFile {
    inner: Box<dyn VfsFile>,
    lease: ViewLease,
}

impl TrackedFile {
    pub(crate) fn new(inner: Box<dyn VfsFile>, lease: ViewLease) -> Self {
        Self { inner, lease }
    }

    /// The container this handle was opened in.
    #[must_use]
    pub fn mount(&self) -> &MountPath {
        self.lease.view().mount()
    }
}

#[async_trait]
impl VfsFile for TrackedFile {
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes> {
        self.inner.read(offset, size).await
    }

    async fn stat(&self) -> io::Result<Metadata> {
        self.inner.stat().await
    }

    async fn read_dir(&self) -> io::Result<Vec<DirEntry>> {
        self.inner.read_dir().await
    }

    /// Closing twice is a no-op.
    async fn close(&self) -> io::Result<()> {
        if !self.lease.release() {
            return Ok(());
        }
        self.inner.close().await
    }
}

impl std::fmt::Debug for TrackedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedFile")
            .field("mount", self.mount())
            .finish_non_exhaustive()
    }
}
