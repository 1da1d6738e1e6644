//! Capability providers: where stage kinds come from.

use std::collections::BTreeMap;
use std::sync::Arc;

use livemix_common::error::{LivemixError, LivemixResult};

use crate::junction::JunctionFactory;
use crate::processor::{Processor, StageConfig};
use crate::queue::QueueFactory;
use crate::stage::{StageDescriptor, StageKind};

/// Builds processors for one stage kind.
pub trait StageFactory: Send + Sync {
    fn descriptor(&self) -> Arc<StageDescriptor>;

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>>;
}

/// Exposes named stage kinds with their ports, formats, and options, and
/// instantiates processors for them.
pub trait CapabilityProvider: Send + Sync {
    fn describe(&self, kind: StageKind) -> Option<Arc<StageDescriptor>>;

    fn instantiate(&self, config: &StageConfig) -> LivemixResult<Box<dyn Processor>>;

    fn kinds(&self) -> Vec<StageKind>;
}

/// A provider assembled from individual factories.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    factories: BTreeMap<StageKind, Arc<dyn StageFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the junction and queue stages.
    pub fn with_core() -> Self {
        let mut registry = Self::new();
        registry.register(JunctionFactory::new());
        registry.register(QueueFactory::new());
        registry
    }

    /// Add or replace the factory for its kind.
    pub fn register(&mut self, factory: impl StageFactory + 'static) -> &mut Self {
        let kind = factory.descriptor().kind;
        if self.factories.insert(kind, Arc::new(factory)).is_some() {
            tracing::debug!(%kind, "Replaced stage factory");
        }
        self
    }

    pub fn into_shared(self) -> Arc<dyn CapabilityProvider> {
        Arc::new(self)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl CapabilityProvider for ProviderRegistry {
    fn describe(&self, kind: StageKind) -> Option<Arc<StageDescriptor>> {
        self.factories.get(&kind).map(|f| f.descriptor())
    }

    fn instantiate(&self, config: &StageConfig) -> LivemixResult<Box<dyn Processor>> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| LivemixError::UnavailableCapability {
                kind: config.kind.to_string(),
            })?;
        factory.create(config).map_err(|e| {
            LivemixError::Other(e.context(format!("Failed to create stage '{}'", config.name)))
        })
    }

    fn kinds(&self) -> Vec<StageKind> {
        self.factories.keys().copied().collect()
    }
}
