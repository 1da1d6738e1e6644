//! Lifecycle controller: state transitions and the dispatch loop.
//!
//! The controller owns the graph. `prepare` validates it, `play` acquires
//! every stage's resources under a timeout and starts one thread per stage,
//! and `run` blocks on the bus until a fault, end-of-stream, or shutdown
//! signal, then tears everything down.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use livemix_common::clock::PipelineClock;
use livemix_common::error::{LivemixError, LivemixResult};

use crate::fault::{bus, BusMessage, BusReceiver, FaultEvent, FaultReporter};
use crate::graph::{Graph, GraphState, TeardownReport};
use crate::port::PortId;
use crate::processor::{InputLink, OutputLink, Processor, StageConfig, StageContext, StageIo, StopFlag};
use crate::queue::{link_queue, LinkReceiver, LinkSender, LinkStats, QueueConfig};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on each stage's resource acquisition.
    pub acquire_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Why the dispatch loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown signal fired.
    Shutdown,
    /// Every sink reached end-of-stream.
    EndOfStream,
    /// A stage reported a fault.
    Fault(FaultEvent),
}

/// Final counters of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSummary {
    pub link: String,
    pub pushed: u64,
    pub dropped: u64,
    pub popped: u64,
}

/// Result of a completed `run`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub reason: StopReason,
    pub report: TeardownReport,
    /// Running time at which each stage produced its first unit.
    pub first_buffers: BTreeMap<String, u64>,
    pub links: Vec<LinkSummary>,
}

/// Dispatch loop state, advanced one bus message at a time by [`dispatch`].
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pending_eos: BTreeSet<String>,
    first_buffers: BTreeMap<String, u64>,
    warnings: usize,
}

impl LoopState {
    /// `sinks` are the stages whose end-of-stream ends the run.
    pub fn new(sinks: impl IntoIterator<Item = String>) -> Self {
        Self {
            pending_eos: sinks.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn first_buffers(&self) -> &BTreeMap<String, u64> {
        &self.first_buffers
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Stop(StopReason),
}

/// Advance the loop state by one message. Any fault stops the graph.
pub fn dispatch(state: &mut LoopState, message: BusMessage) -> Dispatch {
    match message {
        BusMessage::Fault(event) => {
            tracing::error!(
                stage = %event.stage,
                detail = event.detail.as_deref().unwrap_or("none"),
                "Error received from stage: {}",
                event.message
            );
            Dispatch::Stop(StopReason::Fault(event))
        }
        BusMessage::Warning { stage, message } => {
            tracing::warn!(stage = %stage, "{message}");
            state.warnings += 1;
            Dispatch::Continue
        }
        BusMessage::EndOfStream { stage } => {
            state.pending_eos.remove(&stage);
            tracing::debug!(stage = %stage, remaining = state.pending_eos.len(), "End of stream");
            if state.pending_eos.is_empty() {
                tracing::info!("End-Of-Stream reached");
                Dispatch::Stop(StopReason::EndOfStream)
            } else {
                Dispatch::Continue
            }
        }
        BusMessage::FirstBuffer {
            stage,
            running_time_ns,
        } => {
            tracing::debug!(stage = %stage, running_time_ns, "First buffer");
            state.first_buffers.entry(stage).or_insert(running_time_ns);
            Dispatch::Continue
        }
    }
}

struct Worker {
    stage: String,
    handle: JoinHandle<()>,
}

pub struct LifecycleController {
    graph: Graph,
    config: ControllerConfig,
    stop: StopFlag,
    reporter: FaultReporter,
    bus: BusReceiver,
    workers: Vec<Worker>,
    links: Vec<(String, Arc<LinkStats>)>,
    sinks: BTreeSet<String>,
    clock: Option<PipelineClock>,
}

impl LifecycleController {
    pub fn new(graph: Graph, config: ControllerConfig) -> Self {
        let (reporter, bus) = bus();
        Self {
            graph,
            config,
            stop: StopFlag::new(),
            reporter,
            bus,
            workers: Vec::new(),
            links: Vec::new(),
            sinks: BTreeSet::new(),
            clock: None,
        }
    }

    pub fn state(&self) -> GraphState {
        self.graph.state()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The graph, for edits made from the dispatch loop such as placement
    /// changes while playing.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn clock(&self) -> Option<&PipelineClock> {
        self.clock.as_ref()
    }

    /// `Built -> Ready`.
    pub fn prepare(&mut self) -> LivemixResult<()> {
        match self.graph.state() {
            GraphState::Built => {
                self.graph.check_complete()?;
                self.graph.set_state(GraphState::Ready);
                tracing::info!(graph = %self.graph.name(), "Graph ready");
                Ok(())
            }
            GraphState::Ready => Ok(()),
            other => Err(LivemixError::InvalidTransition {
                from: other.to_string(),
                to: GraphState::Ready.to_string(),
            }),
        }
    }

    /// `Ready -> Playing` (preparing first when still `Built`).
    ///
    /// On failure the graph stays in its last good state.
    pub async fn play(&mut self) -> LivemixResult<()> {
        if self.graph.state() == GraphState::Built {
            self.prepare()?;
        }
        if self.graph.state() != GraphState::Ready {
            return Err(LivemixError::InvalidTransition {
                from: self.graph.state().to_string(),
                to: GraphState::Playing.to_string(),
            });
        }

        let order = self.graph.topological_order()?;
        let mut stages: Vec<(StageConfig, Box<dyn Processor>)> = Vec::with_capacity(order.len());
        for id in order {
            let config = self.graph.stage_config(id)?;
            let processor = self.graph.provider().instantiate(&config)?;
            stages.push((config, processor));
        }

        // Sinks first, so an unreachable endpoint fails before sources start.
        for (config, processor) in stages.iter_mut().rev() {
            self.acquire(config, processor.as_mut()).await?;
        }

        let (mut senders, mut receivers) = self.build_links()?;
        let clock = PipelineClock::start();

        for (config, processor) in stages.into_iter().rev() {
            let io = StageIo {
                inputs: config
                    .inputs
                    .iter()
                    .filter_map(|b| {
                        Some(InputLink {
                            binding: b.clone(),
                            rx: receivers.remove(&b.port)?,
                        })
                    })
                    .collect(),
                outputs: config
                    .outputs
                    .iter()
                    .filter_map(|b| {
                        Some(OutputLink {
                            binding: b.clone(),
                            tx: senders.remove(&b.port)?,
                        })
                    })
                    .collect(),
            };
            let is_sink = config.outputs.is_empty();
            if is_sink {
                self.sinks.insert(config.name.clone());
            }
            if let Err(e) = self.spawn(config.name, processor, io, &clock, is_sink) {
                self.halt_workers();
                return Err(e);
            }
        }

        self.graph.set_state(GraphState::Playing);
        tracing::info!(
            graph = %self.graph.name(),
            stages = self.workers.len(),
            epoch = %clock.epoch_wall(),
            "Graph playing"
        );
        self.clock = Some(clock);
        Ok(())
    }

    async fn acquire(&self, config: &StageConfig, processor: &mut dyn Processor) -> LivemixResult<()> {
        let timeout = self.config.acquire_timeout;
        match tokio::time::timeout(timeout, processor.acquire()).await {
            Ok(Ok(())) => {
                tracing::debug!(stage = %config.name, "Resources acquired");
                Ok(())
            }
            Ok(Err(e)) => Err(LivemixError::resource_unavailable(&config.name, format!("{e:#}"))),
            Err(_) => Err(LivemixError::resource_unavailable(
                &config.name,
                format!("acquisition timed out after {} ms", timeout.as_millis()),
            )),
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_links(
        &mut self,
    ) -> LivemixResult<(HashMap<PortId, LinkSender>, HashMap<PortId, LinkReceiver>)> {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        self.links.clear();
        for conn in self.graph.connections() {
            let upstream = self
                .graph
                .port(conn.upstream)
                .and_then(|p| self.graph.stage(p.stage()))
                .ok_or_else(|| LivemixError::invalid_port(format!("{} has no stage", conn.upstream)))?;
            let (tx, rx, stats) = link_queue(QueueConfig::for_link(upstream)?);
            senders.insert(conn.upstream, tx);
            receivers.insert(conn.downstream, rx);
            let label = format!(
                "{} -> {}",
                self.graph.port_label(conn.upstream),
                self.graph.port_label(conn.downstream)
            );
            self.links.push((label, stats));
        }
        Ok((senders, receivers))
    }

    fn spawn(
        &mut self,
        name: String,
        processor: Box<dyn Processor>,
        io: StageIo,
        clock: &PipelineClock,
        is_sink: bool,
    ) -> LivemixResult<()> {
        let ctx = StageContext {
            name: name.clone(),
            clock: clock.clone(),
            stop: self.stop.clone(),
            reporter: self.reporter.for_stage(&name, clock),
        };
        let handle = std::thread::Builder::new()
            .name(format!("livemix-{name}"))
            .spawn(move || run_stage(processor, io, ctx, is_sink))
            .map_err(|e| LivemixError::resource_unavailable(&name, format!("failed to spawn thread: {e}")))?;
        self.workers.push(Worker {
            stage: name,
            handle,
        });
        Ok(())
    }

    /// Dispatch bus messages until a fault, end-of-stream on every sink, or
    /// `shutdown` completes, then stop the graph.
    pub async fn run<F>(&mut self, shutdown: F) -> LivemixResult<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        if self.graph.state() != GraphState::Playing {
            return Err(LivemixError::InvalidTransition {
                from: self.graph.state().to_string(),
                to: GraphState::Stopped.to_string(),
            });
        }
        let mut state = LoopState::new(self.sinks.iter().cloned());
        tokio::pin!(shutdown);

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break StopReason::Shutdown;
                }
                message = self.bus.recv() => match message {
                    Some(message) => {
                        if let Dispatch::Stop(reason) = dispatch(&mut state, message) {
                            break reason;
                        }
                    }
                    None => break StopReason::Shutdown,
                },
            }
        };

        let links = self.link_summaries();
        let report = self.stop();
        Ok(RunOutcome {
            reason,
            report,
            first_buffers: state.first_buffers,
            links,
        })
    }

    pub fn link_summaries(&self) -> Vec<LinkSummary> {
        self.links
            .iter()
            .map(|(link, stats)| LinkSummary {
                link: link.clone(),
                pushed: stats.pushed(),
                dropped: stats.dropped(),
                popped: stats.popped(),
            })
            .collect()
    }

    fn halt_workers(&mut self) {
        self.stop.stop();
        for worker in self.workers.drain(..) {
            if worker.handle.join().is_err() {
                tracing::warn!(stage = %worker.stage, "Stage thread panicked");
            }
        }
    }

    /// Transition to `Stopped` from any state. Always succeeds: stage
    /// threads are stopped and joined, then the graph is torn down.
    pub fn stop(&mut self) -> TeardownReport {
        if self.graph.is_torn_down() {
            return TeardownReport::default();
        }
        self.halt_workers();
        for summary in self.link_summaries() {
            tracing::debug!(
                link = %summary.link,
                pushed = summary.pushed,
                dropped = summary.dropped,
                popped = summary.popped,
                "Link statistics"
            );
        }
        // Drain anything posted while the threads were winding down.
        while let Some(message) = self.bus.try_recv() {
            tracing::trace!(?message, "Discarded bus message after stop");
        }
        self.graph.teardown()
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_stage(processor: Box<dyn Processor>, io: StageIo, ctx: StageContext, is_sink: bool) {
    let name = ctx.name.clone();
    let stop = ctx.stop.clone();
    let reporter = ctx.reporter.clone();
    tracing::debug!(stage = %name, "Stage thread started");

    match catch_unwind(AssertUnwindSafe(move || processor.run(io, ctx))) {
        Ok(Ok(())) if stop.is_stopped() => tracing::debug!(stage = %name, "Stage stopped"),
        Ok(Ok(())) => {
            tracing::debug!(stage = %name, "Stage finished");
            if is_sink {
                reporter.end_of_stream();
            }
        }
        Ok(Err(e)) if stop.is_stopped() => {
            tracing::debug!(stage = %name, error = %e, "Stage error after stop ignored")
        }
        Ok(Err(e)) => {
            let causes: Vec<String> = e.chain().skip(1).map(ToString::to_string).collect();
            let detail = (!causes.is_empty()).then(|| causes.join(": "));
            reporter.fault(e.to_string(), detail);
        }
        Err(_) => reporter.fault("stage thread panicked", None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{linear_graph, MockProvider};

    fn fault(stage: &str) -> BusMessage {
        BusMessage::Fault(FaultEvent {
            stage: stage.into(),
            message: "boom".into(),
            detail: None,
            running_time_ns: 0,
        })
    }

    #[test]
    fn test_dispatch_stops_on_first_fault() {
        let mut state = LoopState::new(["sink".to_string()]);
        assert_eq!(
            dispatch(
                &mut state,
                BusMessage::Warning {
                    stage: "a".into(),
                    message: "slow".into()
                }
            ),
            Dispatch::Continue
        );
        match dispatch(&mut state, fault("encoder")) {
            Dispatch::Stop(StopReason::Fault(event)) => assert_eq!(event.stage, "encoder"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.warnings(), 1);
    }

    #[test]
    fn test_dispatch_waits_for_every_sink() {
        let mut state = LoopState::new(["a".to_string(), "b".to_string()]);
        let eos = |s: &str| BusMessage::EndOfStream { stage: s.into() };
        assert_eq!(dispatch(&mut state, eos("a")), Dispatch::Continue);
        assert_eq!(dispatch(&mut state, eos("a")), Dispatch::Continue);
        assert_eq!(
            dispatch(&mut state, eos("b")),
            Dispatch::Stop(StopReason::EndOfStream)
        );
    }

    #[test]
    fn test_dispatch_keeps_earliest_first_buffer() {
        let mut state = LoopState::default();
        for t in [5, 9] {
            dispatch(
                &mut state,
                BusMessage::FirstBuffer {
                    stage: "compositor".into(),
                    running_time_ns: t,
                },
            );
        }
        assert_eq!(state.first_buffers().get("compositor"), Some(&5));
    }

    #[tokio::test]
    async fn test_incomplete_graph_never_plays() {
        let provider = MockProvider::new().shared();
        let mut graph = Graph::new("test", provider);
        graph
            .add_stage(crate::stage::StageKind::Overlay, "dangling", [])
            .unwrap();
        let mut controller = LifecycleController::new(graph, ControllerConfig::default());
        let err = controller.play().await.unwrap_err();
        assert!(matches!(err, LivemixError::GraphIncomplete { .. }));
        assert_eq!(controller.state(), GraphState::Built);
    }

    #[tokio::test]
    async fn test_end_of_stream_stops_cleanly() {
        let provider = MockProvider::new().with_source_frames(5);
        let tally = provider.tally();
        let graph = linear_graph(provider.shared());
        let mut controller = LifecycleController::new(graph, ControllerConfig::default());
        controller.play().await.unwrap();
        assert_eq!(controller.state(), GraphState::Playing);

        let outcome = controller.run(std::future::pending()).await.unwrap();
        assert_eq!(outcome.reason, StopReason::EndOfStream);
        assert_eq!(controller.state(), GraphState::Stopped);
        assert_eq!(tally.received("sink"), 5);
        assert_eq!(outcome.report.destroyed_stages.first().map(String::as_str), Some("sink"));
        assert_eq!(outcome.report.destroyed_stages.last().map(String::as_str), Some("source"));
    }

    #[tokio::test]
    async fn test_fault_stops_graph_and_halts_delivery() {
        let provider = MockProvider::new().with_fault_after("overlay", 3);
        let tally = provider.tally();
        let graph = linear_graph(provider.shared());
        let mut controller = LifecycleController::new(graph, ControllerConfig::default());
        controller.play().await.unwrap();

        let outcome = controller.run(std::future::pending()).await.unwrap();
        match &outcome.reason {
            StopReason::Fault(event) => assert_eq!(event.stage, "overlay"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(controller.state(), GraphState::Stopped);

        let delivered = tally.received("sink");
        assert!(delivered <= 3);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(tally.received("sink"), delivered);
    }

    #[tokio::test]
    async fn test_connected_stage_cannot_be_removed_while_playing() {
        let provider = MockProvider::new();
        let graph = linear_graph(provider.shared());
        let mut controller = LifecycleController::new(graph, ControllerConfig::default());
        controller.play().await.unwrap();

        let overlay = controller.graph().stage_id("overlay").unwrap();
        let err = controller.graph_mut().remove_stage(overlay).unwrap_err();
        assert!(matches!(err, LivemixError::StageInUse { ref stage, .. } if stage == "overlay"));
        assert_eq!(err.exit_code(), 3);
        assert!(controller.graph().stage(overlay).is_some());
        assert_eq!(controller.state(), GraphState::Playing);

        let report = controller.stop();
        assert_eq!(report.destroyed_stages.len(), 3);
    }

    #[tokio::test]
    async fn test_acquire_failure_leaves_graph_ready() {
        let provider = MockProvider::new().with_acquire_failure("sink");
        let graph = linear_graph(provider.shared());
        let mut controller = LifecycleController::new(graph, ControllerConfig::default());
        let err = controller.play().await.unwrap_err();
        assert!(matches!(err, LivemixError::ResourceUnavailable { ref stage, .. } if stage == "sink"));
        assert_eq!(controller.state(), GraphState::Ready);
        let report = controller.stop();
        assert_eq!(controller.state(), GraphState::Stopped);
        assert_eq!(report.destroyed_stages.len(), 3);
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_transition_failure() {
        let provider = MockProvider::new().with_acquire_hang("sink");
        let graph = linear_graph(provider.shared());
        let config = ControllerConfig {
            acquire_timeout: Duration::from_millis(50),
        };
        let mut controller = LifecycleController::new(graph, config);
        let err = controller.play().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(controller.state(), GraphState::Ready);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_playing_graph() {
        let provider = MockProvider::new();
        let graph = linear_graph(provider.shared());
        let mut controller = LifecycleController::new(graph, ControllerConfig::default());
        controller.play().await.unwrap();
        let outcome = controller
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(outcome.reason, StopReason::Shutdown);
        assert!(outcome.first_buffers.contains_key("source"));
        assert_eq!(outcome.links.len(), 2);
        assert!(controller.play().await.is_err());
    }
}
