//! Fan-out junction: one input replicated to any number of on-demand
//! outputs.
//!
//! Output ports are handed out as [`PortLease`]s. A lease must be released
//! exactly once, either with [`Graph::release_output_port`] or
//! [`PortLease::release`]. A lease dropped without release is queued and
//! the graph releases the port on its next topology change or teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use livemix_common::error::{LivemixError, LivemixResult};

use crate::format::Caps;
use crate::graph::Graph;
use crate::port::{Direction, PortId, Presence, StageId};
use crate::processor::{Processor, StageConfig, StageContext, StageIo};
use crate::provider::StageFactory;
use crate::queue::PushOutcome;
use crate::stage::{CapsRule, PortTemplate, StageDescriptor, StageKind};

/// Scoped ownership of one junction output port.
#[derive(Debug)]
pub struct PortLease {
    port: PortId,
    junction: StageId,
    released: Arc<AtomicBool>,
    abandoned: Weak<Mutex<Vec<PortId>>>,
    armed: bool,
}

impl PortLease {
    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn junction(&self) -> StageId {
        self.junction
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the port now.
    pub fn release(mut self, graph: &mut Graph) -> LivemixResult<()> {
        self.armed = false;
        graph.release_output_port(self.junction, self.port)
    }

    /// Hand the port over to the graph, which releases it at teardown.
    pub fn into_port(mut self) -> PortId {
        self.armed = false;
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.armed || self.is_released() {
            return;
        }
        if let Some(abandoned) = self.abandoned.upgrade() {
            tracing::warn!(port = %self.port, "On-demand port dropped without release");
            abandoned.lock().push(self.port);
        }
    }
}

impl Graph {
    /// Allocate a fresh output port on a junction.
    pub fn request_output_port(&mut self, junction: StageId) -> LivemixResult<PortLease> {
        let kind = self.stage(junction).map(|s| s.kind());
        if kind != Some(StageKind::Junction) {
            return Err(LivemixError::invalid_port(format!(
                "{junction} is not a fan-out junction"
            )));
        }
        let port = self.request_port(junction, Direction::Output)?;
        let released = Arc::new(AtomicBool::new(false));
        self.leases.insert(port, released.clone());
        Ok(PortLease {
            port,
            junction,
            released,
            abandoned: Arc::downgrade(&self.abandoned),
            armed: true,
        })
    }

    /// Detach and free a junction output port.
    ///
    /// Fails with `InvalidPort` when the port was already released or does
    /// not belong to `junction`.
    pub fn release_output_port(&mut self, junction: StageId, port: PortId) -> LivemixResult<()> {
        let owned = self.port(port).is_some_and(|p| {
            p.stage() == junction
                && p.direction() == Direction::Output
                && p.presence() == Presence::Request
        });
        if !owned {
            return Err(LivemixError::invalid_port(format!(
                "{} is not an output port of {junction}",
                self.port_label(port)
            )));
        }
        self.release_port(port)
    }
}

pub(crate) fn junction_descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::Junction, "Replicates its input to every output branch")
        .port(PortTemplate::always("sink", Direction::Input, Caps::any()))
        .port(PortTemplate::request("src_%u", Direction::Output, Caps::any()))
        .caps_rule(CapsRule::Passthrough)
}

pub struct JunctionFactory {
    descriptor: Arc<StageDescriptor>,
}

impl JunctionFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(junction_descriptor()),
        }
    }
}

impl Default for JunctionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for JunctionFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, _config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        Ok(Box::new(JunctionProcessor))
    }
}

struct JunctionProcessor;

impl Processor for JunctionProcessor {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let StageIo { inputs, mut outputs } = io;
        let input = inputs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("junction has no connected input"))?;

        while let Some(buffer) = input.pop(&ctx.stop) {
            // Branch queues never block, so one branch cannot hold up another.
            outputs.retain(|out| match out.push(buffer.clone(), &ctx.stop) {
                PushOutcome::Disconnected => {
                    tracing::debug!(stage = %ctx.name, branch = %out.binding.name, "Branch gone");
                    false
                }
                _ => true,
            });
            if ctx.stop.is_stopped() || outputs.is_empty() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mock_provider;

    fn graph_with_junction() -> (Graph, StageId) {
        let mut graph = Graph::new("test", mock_provider());
        let junction = graph.add_stage(StageKind::Junction, "junction", []).unwrap();
        (graph, junction)
    }

    #[test]
    fn test_request_and_release() {
        let (mut graph, junction) = graph_with_junction();
        let a = graph.request_output_port(junction).unwrap();
        let b = graph.request_output_port(junction).unwrap();
        assert_ne!(a.port(), b.port());
        assert_eq!(graph.port(b.port()).unwrap().name(), "src_1");

        let port = a.port();
        a.release(&mut graph).unwrap();
        assert!(graph.port(port).unwrap().is_released());
        let err = graph.release_output_port(junction, port).unwrap_err();
        assert!(matches!(err, LivemixError::InvalidPort { .. }));

        graph.release_output_port(junction, b.port()).unwrap();
        assert!(b.is_released());
    }

    #[test]
    fn test_branch_stays_attached_while_playing() {
        let (mut graph, junction) = graph_with_junction();
        let lease = graph.request_output_port(junction).unwrap();
        let port = lease.port();
        graph.set_state(crate::graph::GraphState::Playing);

        let err = graph.release_output_port(junction, port).unwrap_err();
        assert!(matches!(err, LivemixError::InvalidTransition { .. }));
        assert!(lease.release(&mut graph).is_err());
        assert!(!graph.port(port).unwrap().is_released());

        // Teardown still gives the port back.
        let report = graph.teardown();
        assert_eq!(report.released_ports, vec!["junction.src_0".to_string()]);
    }

    #[test]
    fn test_release_rejects_foreign_port() {
        let (mut graph, junction) = graph_with_junction();
        let other = graph.add_stage(StageKind::Junction, "other", []).unwrap();
        let lease = graph.request_output_port(other).unwrap();
        let err = graph.release_output_port(junction, lease.port()).unwrap_err();
        assert!(matches!(err, LivemixError::InvalidPort { .. }));

        let sink = graph.ports_of(junction)[0].id();
        assert!(graph.release_output_port(junction, sink).is_err());
        lease.release(&mut graph).unwrap();
    }

    #[test]
    fn test_only_junctions_hand_out_leases() {
        let mut graph = Graph::new("test", mock_provider());
        let overlay = graph.add_stage(StageKind::Overlay, "overlay", []).unwrap();
        assert!(matches!(
            graph.request_output_port(overlay),
            Err(LivemixError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_dropped_lease_is_released_by_graph() {
        let (mut graph, junction) = graph_with_junction();
        let port = {
            let lease = graph.request_output_port(junction).unwrap();
            lease.port()
        };
        assert!(!graph.port(port).unwrap().is_released());
        graph.release_abandoned();
        assert!(graph.port(port).unwrap().is_released());
    }

    #[test]
    fn test_teardown_disarms_outstanding_leases() {
        let (mut graph, junction) = graph_with_junction();
        let lease = graph.request_output_port(junction).unwrap();
        let report = graph.teardown();
        assert_eq!(report.released_ports, vec!["junction.src_0".to_string()]);
        assert!(lease.is_released());
        drop(lease);
        assert!(graph.abandoned.lock().is_empty());
    }

    #[test]
    fn test_into_port_leaves_release_to_teardown() {
        let (mut graph, junction) = graph_with_junction();
        let port = graph.request_output_port(junction).unwrap().into_port();
        graph.release_abandoned();
        assert!(!graph.port(port).unwrap().is_released());
        let report = graph.teardown();
        assert_eq!(report.released_ports.len(), 1);
    }
}
