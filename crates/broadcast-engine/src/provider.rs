//! The stage kinds this runtime ships with.

use std::sync::Arc;

use livemix_pipeline_core::{CapabilityProvider, ProviderRegistry};

/// Junction, queue, every render stage and every publish stage.
pub fn builtin_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_core();
    livemix_render_engine::register(&mut registry);
    livemix_publish_engine::register(&mut registry);
    registry
}

pub fn builtin_provider() -> Arc<dyn CapabilityProvider> {
    builtin_registry().into_shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use livemix_pipeline_core::StageKind;

    #[test]
    fn test_every_kind_is_provided() {
        let provider = builtin_provider();
        for kind in StageKind::ALL {
            let descriptor = provider.describe(kind).unwrap_or_else(|| panic!("{kind} missing"));
            assert_eq!(descriptor.kind, kind);
        }
    }
}
