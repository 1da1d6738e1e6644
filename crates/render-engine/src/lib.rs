//! livemix render engine
//!
//! Raw-video stages: synthetic capture sources, the running-time overlay,
//! the compositor, pixel-layout conversion, and the local render sink.
//!
//! ```text
//! source ──► overlay ──┐
//! source ──► overlay ──┼──► compositor ──► … ──► convert ──► local sink
//! source ──► overlay ──┘
//! ```

pub mod compositor;
pub mod convert;
pub mod draw;
pub mod font;
pub mod overlay;
pub mod sink;
pub mod source;

use livemix_pipeline_core::ProviderRegistry;

pub use compositor::{Canvas, CompositorFactory};
pub use convert::ConvertFactory;
pub use overlay::TimeOverlayFactory;
pub use sink::{FrameObserver, LocalSinkFactory};
pub use source::{Pattern, TestPatternFactory};

/// Register every render stage with default settings.
pub fn register(registry: &mut ProviderRegistry) {
    registry
        .register(TestPatternFactory::new())
        .register(TimeOverlayFactory::new())
        .register(CompositorFactory::new())
        .register(ConvertFactory::new())
        .register(LocalSinkFactory::new());
}
