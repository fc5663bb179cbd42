//! Container providers for common archive formats.
//!
//! Both providers read the whole archive through the parent filesystem, index it in memory, and
//! serve every read from that index. This keeps views independent of the parent once created,
//! which is what allows the parent to be another archive's view.

/// `.tar` archives.
pub mod tar;
/// `.zip` archives.
pub mod zip;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::fs::{ContainerView, DirEntry, Metadata, ReadOnlyFs, VfsFile, read_all};
use crate::path::{MountPath, VfsPath};

pub use self::tar::TarProvider;
pub use self::zip::ZipProvider;

/// Read the raw bytes of the container at `mount` from `parent`.
pub(crate) async fn read_container(
    parent: &dyn ReadOnlyFs,
    mount: &MountPath,
) -> io::Result<Bytes> {
    let file = parent.open(&mount.to_vfs_path()).await?;
    let data = read_all(file.as_ref()).await;
    let closed = file.close().await;
    let data = data?;
    closed?;
    trace!(mount = %mount, len = data.len(), "read container");
    Ok(data)
}

#[derive(Debug, Clone)]
struct FileNode {
    data: Bytes,
    modified: Option<SystemTime>,
}

/// Every file and directory of one archive, keyed by normalized path.
///
/// Directories that only exist implicitly, as a prefix of some file's path, are present too.
#[derive(Debug, Default)]
pub(crate) struct ArchiveIndex {
    files: BTreeMap<String, FileNode>,
    dirs: BTreeMap<String, BTreeSet<String>>,
}

impl ArchiveIndex {
    pub(crate) fn new() -> Self {
        let mut dirs = BTreeMap::new();
        dirs.insert(VfsPath::root().as_str().to_owned(), BTreeSet::new());
        Self {
            files: BTreeMap::new(),
            dirs,
        }
    }

    /// Record a regular file. Later entries for the same path win, as with `tar -x`.
    pub(crate) fn insert_file(
        &mut self,
        raw_name: &str,
        data: Bytes,
        modified: Option<SystemTime>,
    ) -> io::Result<()> {
        let path = entry_path(raw_name)?;
        if path.is_root() || self.dirs.contains_key(path.as_str()) {
            return Err(invalid_entry(raw_name, "file path collides with a directory"));
        }
        self.link_parents(&path)?;
        self.files
            .insert(path.as_str().to_owned(), FileNode { data, modified });
        Ok(())
    }

    /// Record a directory, along with any missing parents.
    pub(crate) fn insert_dir(&mut self, raw_name: &str) -> io::Result<()> {
        let path = entry_path(raw_name)?;
        if path.is_root() {
            return Ok(());
        }
        if self.files.contains_key(path.as_str()) {
            return Err(invalid_entry(raw_name, "directory path collides with a file"));
        }
        self.link_parents(&path)?;
        self.dirs.entry(path.as_str().to_owned()).or_default();
        Ok(())
    }

    fn link_parents(&mut self, path: &VfsPath) -> io::Result<()> {
        let mut parent = VfsPath::root();
        for name in path.segments() {
            if self.files.contains_key(parent.as_str()) {
                return Err(invalid_entry(
                    path.as_str(),
                    "a parent directory is also a file",
                ));
            }
            self.dirs
                .entry(parent.as_str().to_owned())
                .or_default()
                .insert(name.to_owned());
            parent = parent.join(name);
        }
        Ok(())
    }

    fn metadata(&self, path: &str) -> Option<Metadata> {
        if let Some(file) = self.files.get(path) {
            return Some(Metadata::file(file.data.len() as u64, file.modified));
        }
        self.dirs.contains_key(path).then(|| Metadata::directory(None))
    }

    fn list(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        let Some(children) = self.dirs.get(path.as_str()) else {
            return Err(self.missing_dir(path));
        };
        Ok(children
            .iter()
            .filter_map(|name| {
                let metadata = self.metadata(path.join(name).as_str())?;
                Some(DirEntry {
                    name: name.clone(),
                    metadata,
                })
            })
            .collect())
    }

    fn missing_dir(&self, path: &VfsPath) -> io::Error {
        if self.files.contains_key(path.as_str()) {
            io::Error::new(io::ErrorKind::NotADirectory, format!("{path} is a file"))
        } else {
            not_found(path)
        }
    }

    pub(crate) fn file_count(&self) -> usize {
        self.files.len()
    }
}

fn entry_path(raw_name: &str) -> io::Result<VfsPath> {
    VfsPath::parse(raw_name).map_err(|e| invalid_entry(raw_name, &e.to_string()))
}

fn invalid_entry(name: &str, reason: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid archive entry {name:?}: {reason}"),
    )
}

fn not_found(path: &VfsPath) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path} not found in archive"))
}

/// A view serving an [`ArchiveIndex`].
///
/// Closing drops the index; every later request fails. Handles opened before the close keep
/// the data they reference.
#[derive(Debug)]
pub(crate) struct ArchiveView {
    mount: MountPath,
    index: RwLock<Option<Arc<ArchiveIndex>>>,
}

impl ArchiveView {
    pub(crate) fn new(mount: MountPath, index: ArchiveIndex) -> Self {
        Self {
            mount,
            index: RwLock::new(Some(Arc::new(index))),
        }
    }

    async fn index(&self) -> io::Result<Arc<ArchiveIndex>> {
        self.index.read().await.clone().ok_or_else(|| {
            io::Error::other(format!("view of {} has been closed", self.mount))
        })
    }
}

#[async_trait]
impl ReadOnlyFs for ArchiveView {
    async fn open(&self, path: &VfsPath) -> io::Result<Box<dyn VfsFile>> {
        let index = self.index().await?;
        if let Some(file) = index.files.get(path.as_str()) {
            return Ok(Box::new(MemFile {
                node: file.clone(),
            }));
        }
        if index.dirs.contains_key(path.as_str()) {
            return Ok(Box::new(MemDir {
                path: path.clone(),
                index,
            }));
        }
        Err(not_found(path))
    }

    async fn read_dir(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        self.index().await?.list(path)
    }
}

#[async_trait]
impl ContainerView for ArchiveView {
    async fn close(&self) -> io::Result<()> {
        if self.index.write().await.take().is_some() {
            debug!(mount = %self.mount, "released archive index");
        }
        Ok(())
    }
}

struct MemFile {
    node: FileNode,
}

#[async_trait]
impl VfsFile for MemFile {
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes> {
        let len = self.node.data.len();
        let start = usize::try_from(offset).map_or(len, |o| o.min(len));
        let end = start.saturating_add(size as usize).min(len);
        Ok(self.node.data.slice(start..end))
    }

    async fn stat(&self) -> io::Result<Metadata> {
        Ok(Metadata::file(
            self.node.data.len() as u64,
            self.node.modified,
        ))
    }
}

struct MemDir {
    path: VfsPath,
    index: Arc<ArchiveIndex>,
}

#[async_trait]
impl VfsFile for MemDir {
    async fn read(&self, _offset: u64, _size: u32) -> io::Result<Bytes> {
        Err(io::Error::new(
            io::ErrorKind::IsADirectory,
            format!("{} is a directory", self.path),
        ))
    }

    async fn stat(&self) -> io::Result<Metadata> {
        Ok(Metadata::directory(None))
    }

    async fn read_dir(&self) -> io::Result<Vec<DirEntry>> {
        self.index.list(&self.path)
    }
}
