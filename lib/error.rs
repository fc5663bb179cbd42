//! Errors surfaced by [`DeepFs`](crate::fs::deep::DeepFs).

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::path::{ContainerExtension, MountPath, PathError};

/// Everything that can go wrong while serving `open` or `read_dir`.
///
/// Each variant names the path the caller asked for. Failures to close a view during eviction are
/// not represented here: eviction is not caused by any one request, so those are logged instead.
#[derive(Debug, Error)]
pub enum FsError {
    /// The input path could not be normalized.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// A segment matched an extension, but no provider is registered for it.
    #[error("no provider registered for {extension} (while resolving {path:?})")]
    ProviderNotFound {
        /// The requested path.
        path: String,
        /// The extension that matched.
        extension: ContainerExtension,
    },

    /// The provider could not build a view for the container.
    #[error("cannot open container {mount} (while resolving {path:?}): {source}")]
    ProviderCreation {
        /// The requested path.
        path: String,
        /// The container that failed to open.
        mount: MountPath,
        /// The provider's error. Shared, since every caller waiting on the creation receives it.
        #[source]
        source: Arc<io::Error>,
    },

    /// The view rejected the path inside the container.
    #[error("cannot access {path:?} inside {mount}: {source}")]
    Container {
        /// The requested path.
        path: String,
        /// The container the path resolved into.
        mount: MountPath,
        /// The view's error.
        #[source]
        source: io::Error,
    },

    /// The base filesystem failed.
    #[error("cannot access {path:?}: {source}")]
    Base {
        /// The requested path.
        path: String,
        /// The base filesystem's error.
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// The closest [`io::ErrorKind`] for this error.
    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::InvalidPath(_) => io::ErrorKind::InvalidInput,
            Self::ProviderNotFound { .. } => io::ErrorKind::Unsupported,
            Self::ProviderCreation { source, .. } => source.kind(),
            Self::Container { source, .. } | Self::Base { source, .. } => source.kind(),
        }
    }

    /// Whether the requested entry does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == io::ErrorKind::NotFound
    }
}

impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        Self::new(e.kind(), e)
    }
}
