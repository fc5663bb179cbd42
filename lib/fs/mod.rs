//! Useful filesystem generalizations.
//!
//! The traits here are the seams of the crate: [`ReadOnlyFs`] is what a base filesystem must
//! provide, [`ViewProvider`] builds a [`ContainerView`] for one archive format, and [`VfsFile`] is
//! the handle every `open` returns.

/// Reference container providers (tar, zip).
pub mod archive;
/// The composite filesystem facade.
pub mod deep;
/// Read-only filesystem over a host directory.
pub mod local;
/// Containers nested inside containers.
pub mod nested;
/// Open-file handles bound to a cached view.
pub mod tracked_file;
/// Bounded, expiring cache of container views.
pub mod view_cache;

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::path::{MountPath, VfsPath};

/// The type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
}

/// Metadata of a file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// What kind of entry this is.
    pub kind: EntryKind,
    /// Size in bytes. Zero for directories.
    pub size: u64,
    /// Last modification time, when the backing store records one.
    pub modified: Option<SystemTime>,
}

impl Metadata {
    /// Metadata for a directory.
    #[must_use]
    pub fn directory(modified: Option<SystemTime>) -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            modified,
        }
    }

    /// Metadata for a regular file of `size` bytes.
    #[must_use]
    pub fn file(size: u64, modified: Option<SystemTime>) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            modified,
        }
    }

    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A directory entry returned by [`ReadOnlyFs::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The name of this entry within its parent directory.
    pub name: String,
    /// Metadata of the entry.
    pub metadata: Metadata,
}

impl DirEntry {
    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }
}

/// An open file or directory.
#[async_trait]
pub trait VfsFile: Send + Sync {
    /// Read up to `size` bytes starting at byte `offset`. An empty buffer signals end of file.
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes>;

    /// Metadata of the open entry.
    async fn stat(&self) -> io::Result<Metadata>;

    /// List the children of an open directory.
    async fn read_dir(&self) -> io::Result<Vec<DirEntry>> {
        Err(io::Error::new(
            io::ErrorKind::NotADirectory,
            "handle does not refer to a directory",
        ))
    }

    /// Release any resources held by this handle.
    ///
    /// Called at most once by well-behaved callers. The default implementation is a no-op.
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A read-only filesystem addressed by normalized paths.
///
/// Both the base filesystem and every container view implement this. Implementations must be
/// safe for concurrent use: the view cache shares one view between all callers whose paths
/// resolve into the same container.
#[async_trait]
pub trait ReadOnlyFs: Send + Sync + 'static {
    /// Open the entry at `path`.
    async fn open(&self, path: &VfsPath) -> io::Result<Box<dyn VfsFile>>;

    /// List the directory at `path`, in the order the filesystem defines.
    async fn read_dir(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>>;
}

/// A filesystem view over the contents of a single container.
#[async_trait]
pub trait ContainerView: ReadOnlyFs {
    /// Release everything the view holds. The view cache calls this at most once.
    async fn close(&self) -> io::Result<()>;
}

/// Builds [`ContainerView`]s for one container format.
#[async_trait]
pub trait ViewProvider: Send + Sync + 'static {
    /// The extension this provider handles, e.g. `.zip`.
    fn extension(&self) -> &str;

    /// Open the container at `mount` inside `parent` and return a view onto its contents.
    ///
    /// Fails when the container is missing, unreadable or corrupt.
    async fn create_view(
        &self,
        parent: Arc<dyn ReadOnlyFs>,
        mount: &MountPath,
    ) -> io::Result<Arc<dyn ContainerView>>;
}

/// Read an open file from its start until end of file.
pub async fn read_all(file: &dyn VfsFile) -> io::Result<Bytes> {
    const CHUNK: u32 = 64 * 1024;

    let mut buf = BytesMut::new();
    loop {
        let chunk = file.read(buf.len() as u64, CHUNK).await?;
        if chunk.is_empty() {
            return Ok(buf.freeze());
        }
        buf.extend_from_slice(&chunk);
    }
}
