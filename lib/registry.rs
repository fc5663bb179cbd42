//! Maps container extensions to the providers that can open them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::fs::ViewProvider;
use crate::path::ContainerExtension;

/// Why a provider could not be registered.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The extension is empty once its leading dot is stripped.
    #[error("cannot register a provider under an empty extension ({0:?})")]
    EmptyExtension(String),
}

/// Extension to [`ViewProvider`] map.
///
/// Populated while the filesystem is being built and never mutated afterwards, so lookups need no
/// synchronization. Registering a second provider for an extension replaces the first.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ContainerExtension, Arc<dyn ViewProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for `extension`. Extensions are case-insensitive and the leading dot is
    /// optional.
    pub fn register(
        &mut self,
        extension: &str,
        provider: Arc<dyn ViewProvider>,
    ) -> Result<(), RegistryError> {
        let ext = ContainerExtension::new(extension)
            .ok_or_else(|| RegistryError::EmptyExtension(extension.to_owned()))?;
        if self.providers.insert(ext.clone(), provider).is_some() {
            debug!(extension = %ext, "replaced previously registered provider");
        }
        Ok(())
    }

    /// Register `provider` under the extension it reports for itself.
    pub fn with_provider(mut self, provider: Arc<dyn ViewProvider>) -> Result<Self, RegistryError> {
        let extension = provider.extension().to_owned();
        self.register(&extension, provider)?;
        Ok(self)
    }

    /// The provider registered for `extension`, if any.
    #[must_use]
    pub fn lookup(&self, extension: &ContainerExtension) -> Option<Arc<dyn ViewProvider>> {
        self.providers.get(extension).cloned()
    }

    /// Whether a provider is registered for `extension`.
    #[must_use]
    pub fn contains(&self, extension: &ContainerExtension) -> bool {
        self.providers.contains_key(extension)
    }

    /// All registered extensions, sorted.
    #[must_use]
    pub fn extensions(&self) -> Vec<ContainerExtension> {
        let mut exts: Vec<_> = self.providers.keys().cloned().collect();
        exts.sort_unstable();
        exts
    }

    /// Number of registered extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("extensions", &self.extensions())
            .finish()
    }
}
