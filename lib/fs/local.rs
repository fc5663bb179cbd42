//! A read-only filesystem that directly overlays a host directory.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::fs::{DirEntry, EntryKind, Metadata, ReadOnlyFs, VfsFile};
use crate::path::VfsPath;

/// Serves paths relative to a root directory on the host.
///
/// Paths reaching this filesystem are already normalized, so they cannot climb out of the root.
/// Symbolic links are followed.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Serve the host directory at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The host directory this filesystem serves.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &VfsPath) -> PathBuf {
        if path.is_root() {
            return self.root.clone();
        }
        path.segments().fold(self.root.clone(), |acc, seg| acc.join(seg))
    }
}

fn metadata_of(meta: &std::fs::Metadata) -> Metadata {
    let kind = if meta.is_dir() {
        EntryKind::Directory
    } else if meta.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    };
    Metadata {
        kind,
        size: if kind == EntryKind::Directory {
            0
        } else {
            meta.len()
        },
        modified: meta.modified().ok(),
    }
}

async fn list_host_dir(dir: &Path) -> io::Result<Vec<DirEntry>> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;

    // The directory may change under us at any time, so it is re-read on every call.
    let mut entries = Vec::new();
    while let Some(dir_entry) = read_dir.next_entry().await? {
        let Ok(name) = dir_entry.file_name().into_string() else {
            warn!(dir = %dir.display(), "skipping directory entry with a non UTF-8 name");
            continue;
        };
        // Follow symlinks like `open` does; a dangling one is reported as a link.
        let meta = match tokio::fs::metadata(dir_entry.path()).await {
            Ok(meta) => meta,
            Err(_) => dir_entry.metadata().await?,
        };
        entries.push(DirEntry {
            name,
            metadata: metadata_of(&meta),
        });
    }
    entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[async_trait]
impl ReadOnlyFs for LocalFs {
    async fn open(&self, path: &VfsPath) -> io::Result<Box<dyn VfsFile>> {
        let host = self.host_path(path);
        let meta = tokio::fs::metadata(&host).await?;
        trace!(path = %path, host = %host.display(), "opening host entry");

        if meta.is_dir() {
            return Ok(Box::new(LocalDir {
                path: host,
                metadata: metadata_of(&meta),
            }));
        }

        let file = tokio::fs::File::open(&host).await?;
        Ok(Box::new(LocalFile {
            file: Mutex::new(file),
            metadata: metadata_of(&meta),
        }))
    }

    async fn read_dir(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        list_host_dir(&self.host_path(path)).await
    }
}

/// An open host file. Reads are positional; the shared cursor is guarded by a lock.
#[derive(Debug)]
struct LocalFile {
    file: Mutex<tokio::fs::File>,
    metadata: Metadata,
}

#[async_trait]
impl VfsFile for LocalFile {
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;

        // Sized from the metadata taken at open; a file that grew since still reads to the end.
        let expected = self.metadata.size.saturating_sub(offset).min(u64::from(size));
        let mut buffer = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
        (&mut *file).take(u64::from(size)).read_to_end(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    async fn stat(&self) -> io::Result<Metadata> {
        Ok(self.metadata)
    }
}

#[derive(Debug)]
struct LocalDir {
    path: PathBuf,
    metadata: Metadata,
}

#[async_trait]
impl VfsFile for LocalDir {
    async fn read(&self, _offset: u64, _size: u32) -> io::Result<Bytes> {
        Err(io::Error::new(
            io::ErrorKind::IsADirectory,
            "cannot read a directory",
        ))
    }

    async fn stat(&self) -> io::Result<Metadata> {
        Ok(self.metadata)
    }

    async fn read_dir(&self) -> io::Result<Vec<DirEntry>> {
        list_host_dir(&self.path).await
    }
}
