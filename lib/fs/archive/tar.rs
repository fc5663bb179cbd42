use std::io::{self, Cursor, Read as _};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use super::{ArchiveIndex, ArchiveView, read_container};
use crate::fs::{ContainerView, ReadOnlyFs, ViewProvider};
use crate::path::MountPath;

/// Opens uncompressed tar archives.
///
/// Regular files and directories are exposed; links and special files are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarProvider;

impl TarProvider {
    /// A tar provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn index_tar(data: &Bytes) -> io::Result<ArchiveIndex> {
    let mut index = ArchiveIndex::new();
    let mut archive = ::tar::Archive::new(Cursor::new(data.as_ref()));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        let Some(name) = path.to_str().map(str::to_owned) else {
            debug!(path = %path.display(), "skipping tar entry with a non UTF-8 name");
            continue;
        };

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            index.insert_dir(&name)?;
        } else if kind.is_file() {
            let modified = entry
                .header()
                .mtime()
                .ok()
                .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            index.insert_file(&name, Bytes::from(contents), modified)?;
        } else {
            debug!(name, entry_type = ?kind, "skipping unsupported tar entry");
        }
    }

    Ok(index)
}

#[async_trait]
impl ViewProvider for TarProvider {
    fn extension(&self) -> &str {
        ".tar"
    }

    async fn create_view(
        &self,
        parent: Arc<dyn ReadOnlyFs>,
        mount: &MountPath,
    ) -> io::Result<Arc<dyn ContainerView>> {
        let data = read_container(parent.as_ref(), mount).await?;
        let index = tokio::task::spawn_blocking(move || index_tar(&data))
            .await
            .map_err(io::Error::other)??;
        info!(mount = %mount, files = index.file_count(), "indexed tar archive");
        Ok(Arc::new(ArchiveView::new(mount.clone(), index)))
    }
}
