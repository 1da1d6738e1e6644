//! livemix pipeline core
//!
//! The processing graph and everything needed to run it: stages and their
//! ports, format negotiation, on-demand junction outputs, link queues, the
//! fault bus, and the lifecycle controller that drives a graph from `Built`
//! to `Stopped`.
//!
//! # Topology
//!
//! ```text
//! capture0 ─ overlay0 ─┐
//! capture1 ─ overlay1 ─┼─ compositor ─ junction ─┬─ queue ─ local sink
//! captureN ─ overlayN ─┘                         └─ queue ─ encoder ─ muxer ─ network sink
//! ```
//!
//! Concrete media stages live in the render and publish engines; this crate
//! only knows them through [`provider::CapabilityProvider`].

pub mod buffer;
pub mod builder;
pub mod controller;
pub mod dot;
pub mod fault;
pub mod format;
pub mod graph;
pub mod junction;
pub mod layout;
pub mod port;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod stage;

#[cfg(test)]
pub(crate) mod test_support;

pub use buffer::{Buffer, EncodedUnit, Payload, VideoFrame, VideoFrameMut};
pub use builder::*;
pub use controller::*;
pub use fault::{BusMessage, FaultEvent, FaultReporter};
pub use format::*;
pub use graph::*;
pub use junction::PortLease;
pub use layout::{Background, Layout, Placement, SharedLayout};
pub use port::*;
pub use processor::*;
pub use provider::*;
pub use queue::{Leaky, QueueConfig};
pub use stage::*;
