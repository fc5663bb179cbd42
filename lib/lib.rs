//! deep-fs shared library.
//!
//! Exposes archives found inside a base filesystem as if they were ordinary directories. See
//! [`fs::deep::DeepFs`] for the entry point.

/// Caching primitives for deep-fs.
pub mod cache;
/// Error types surfaced by the filesystem facade.
pub mod error;
/// Filesystem abstractions, the view cache and the composite facade.
pub mod fs;
/// Path normalization and container-boundary resolution.
pub mod path;
/// Extension to provider registry.
pub mod registry;
/// Synchronization shims for loom.
pub mod sync;

pub use error::FsError;
pub use fs::deep::{DeepFs, DeepFsBuilder};
pub use fs::view_cache::ViewCacheConfig;
pub use path::{ContainerExtension, MountPath, VfsPath};
pub use registry::ProviderRegistry;
