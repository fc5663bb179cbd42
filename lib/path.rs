//! Logical paths, mount paths and container-boundary resolution.
//!
//! Every path handed to [`DeepFs`](crate::fs::deep::DeepFs) is first normalized into a
//! [`VfsPath`]: a slash-separated, root-relative path with no empty, `.` or `..` segments. The
//! root is spelled `"."`, which is also what providers receive when asked for the root of a view.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::registry::ProviderRegistry;

/// Reasons a raw path cannot be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// A `..` segment climbs above the filesystem root.
    #[error("path {path:?} escapes the filesystem root")]
    EscapesRoot {
        /// The offending input.
        path: String,
    },

    /// The path contains an interior NUL byte.
    #[error("path {path:?} contains a NUL byte")]
    NulByte {
        /// The offending input.
        path: String,
    },
}

/// A normalized, root-relative, slash-separated path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VfsPath(String);

impl VfsPath {
    const ROOT: &'static str = ".";

    /// The root of a filesystem.
    #[must_use]
    pub fn root() -> Self {
        Self(Self::ROOT.to_owned())
    }

    /// Normalize `raw`.
    ///
    /// Leading slashes are ignored, repeated separators collapse, `.` segments are dropped and
    /// `..` removes the preceding segment. An empty input is the root.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.contains('\0') {
            return Err(PathError::NulByte {
                path: raw.to_owned(),
            });
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::EscapesRoot {
                            path: raw.to_owned(),
                        });
                    }
                }
                s => segments.push(s),
            }
        }

        Ok(Self::from_segments(&segments))
    }

    fn from_segments(segments: &[&str]) -> Self {
        if segments.is_empty() {
            Self::root()
        } else {
            Self(segments.join("/"))
        }
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// The path as a string. The root is `"."`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The segments of this path, left to right. Empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        let s = if self.is_root() { "" } else { self.0.as_str() };
        s.split('/').filter(|seg| !seg.is_empty())
    }

    /// The last segment, or `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Append a single child name to this path.
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self(name.to_owned())
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VfsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The path prefix that identifies a container inside the base filesystem.
///
/// Mount paths are only produced by [`resolve`], so two logical paths that name the same container
/// always yield equal mount paths. Cloning is cheap; the view cache uses this as its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountPath(Arc<str>);

impl MountPath {
    /// The mount path as a string, relative to the base filesystem root.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The container's location as a path in the base filesystem.
    #[must_use]
    pub fn to_vfs_path(&self) -> VfsPath {
        VfsPath(self.0.to_string())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(raw: &str) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for MountPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lower-cased file extension including its leading dot, e.g. `.zip`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerExtension(Arc<str>);

impl ContainerExtension {
    /// Build an extension from user input. `zip`, `.zip` and `.ZIP` are equivalent.
    ///
    /// Returns `None` for an empty extension.
    #[must_use]
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.strip_prefix('.').unwrap_or(raw);
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(format!(".{}", trimmed.to_lowercase()).into()))
    }

    /// The extension of a single path segment: everything from its last `.` on.
    ///
    /// `archive.tar.gz` yields `.gz`; `README` and `trailing.` yield `None`.
    #[must_use]
    pub fn of_segment(segment: &str) -> Option<Self> {
        let dot = segment.rfind('.')?;
        Self::new(&segment[dot..])
    }

    /// The extension as a string, including the leading dot.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical path split at its first container boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Path of the container inside the base filesystem.
    pub mount: MountPath,
    /// Remainder of the path inside the container. The root of the view when empty.
    pub inner: VfsPath,
    /// Extension of the container segment, used to pick the provider.
    pub extension: ContainerExtension,
}

/// Split `path` at the leftmost segment whose extension has a registered provider.
///
/// Returns `None` when no segment matches, meaning the path lives entirely in the base
/// filesystem. Only the first boundary is resolved; anything after it, including further archive
/// names, is handed to the container's view untouched.
#[must_use]
pub fn resolve(registry: &ProviderRegistry, path: &VfsPath) -> Option<Resolution> {
    let segments: Vec<&str> = path.segments().collect();
    let (idx, extension) = segments.iter().enumerate().find_map(|(idx, segment)| {
        ContainerExtension::of_segment(segment)
            .filter(|ext| registry.contains(ext))
            .map(|ext| (idx, ext))
    })?;

    Some(Resolution {
        mount: MountPath(segments[..=idx].join("/").into()),
        inner: VfsPath::from_segments(&segments[idx + 1..]),
        extension,
    })
}
