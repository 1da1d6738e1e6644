//! livemix publish engine
//!
//! The network branch after the fan-out junction:
//!
//! ```text
//! queue ──► encoder (H.264) ──► muxer (FLV) ──► network sink ──► rtmp:// | tcp:// | file://
//! ```

pub mod encoder;
pub mod endpoint;
pub mod flv;
pub mod network;

use livemix_pipeline_core::ProviderRegistry;

pub use encoder::EncoderFactory;
pub use endpoint::{Endpoint, EndpointError};
pub use flv::FlvMuxerFactory;
pub use network::NetworkSinkFactory;

/// Register the encoder, muxer and network sink stages.
pub fn register(registry: &mut ProviderRegistry) {
    registry
        .register(EncoderFactory::new())
        .register(FlvMuxerFactory::new())
        .register(NetworkSinkFactory::new());
}
