//! Provider registry keyed by backend kind.

use crate::{Provider, ProviderFactory, ProviderKind};
use flock_core::{FlockResult, LlmError, ModelDetails};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of provider factories.
/// Factories must be explicitly registered - no auto-discovery.
///
/// # Example
/// ```ignore
/// let mut registry = ProviderRegistry::new();
/// registry.register(ProviderKind::OpenAi, Arc::new(my_openai_factory));
///
/// // Resolves `details.provider_name` and builds a fresh provider.
/// let provider = registry.create(&details)?;
/// ```
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for `kind`, replacing any previous one.
    ///
    /// # Arguments
    /// * `kind` - The backend the factory builds providers for
    /// * `factory` - The factory to register
    pub fn register(&mut self, kind: ProviderKind, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(kind, factory);
    }

    /// Get the factory registered for `kind`.
    ///
    /// # Returns
    /// * `Ok(Arc<dyn ProviderFactory>)` - The registered factory
    /// * `Err(FlockError::Llm(LlmError::ProviderNotConfigured))` - If none is registered
    pub fn factory(&self, kind: ProviderKind) -> FlockResult<Arc<dyn ProviderFactory>> {
        self.factories.get(&kind).cloned().ok_or_else(|| {
            LlmError::ProviderNotConfigured {
                provider: kind.to_string(),
            }
            .into()
        })
    }

    /// Check if a factory is registered for `kind`.
    pub fn has(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Remove the factory registered for `kind`.
    pub fn clear(&mut self, kind: ProviderKind) {
        self.factories.remove(&kind);
    }
}

impl ProviderFactory for ProviderRegistry {
    fn create(&self, details: &ModelDetails) -> FlockResult<Box<dyn Provider>> {
        let kind: ProviderKind = details.provider_name.parse()?;
        self.factory(kind)?.create(details)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().map(ProviderKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("registered", &kinds)
            .finish()
    }
}
