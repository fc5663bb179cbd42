use std::io::{self, Cursor, Read as _};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use super::{ArchiveIndex, ArchiveView, read_container};
use crate::fs::{ContainerView, ReadOnlyFs, ViewProvider};
use crate::path::MountPath;

/// Opens zip archives with stored or deflated entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipProvider;

impl ZipProvider {
    /// A zip provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn index_zip(data: &Bytes) -> io::Result<ArchiveIndex> {
    let mut index = ArchiveIndex::new();
    let mut archive = ::zip::ZipArchive::new(Cursor::new(data.as_ref())).map_err(zip_error)?;

    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx).map_err(zip_error)?;
        let name = entry.name().to_owned();
        if entry.is_dir() {
            index.insert_dir(&name)?;
            continue;
        }
        if !entry.is_file() {
            debug!(name, "skipping unsupported zip entry");
            continue;
        }

        let mut contents = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry.read_to_end(&mut contents)?;
        index.insert_file(&name, Bytes::from(contents), None)?;
    }

    Ok(index)
}

fn zip_error(e: ::zip::result::ZipError) -> io::Error {
    match e {
        ::zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

#[async_trait]
impl ViewProvider for ZipProvider {
    fn extension(&self) -> &str {
        ".zip"
    }

    async fn create_view(
        &self,
        parent: Arc<dyn ReadOnlyFs>,
        mount: &MountPath,
    ) -> io::Result<Arc<dyn ContainerView>> {
        let data = read_container(parent.as_ref(), mount).await?;
        let index = tokio::task::spawn_blocking(move || index_zip(&data))
            .await
            .map_err(io::Error::other)??;
        info!(mount = %mount, files = index.file_count(), "indexed zip archive");
        Ok(Arc::new(ArchiveView::new(mount.clone(), index)))
    }
}
