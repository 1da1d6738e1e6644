//! Assembles the broadcast topology:
//!
//! ```text
//! capture{i} -> overlay{i} -+
//!                           +-> compositor -> junction -+-> playback_queue -> [convert] -> playback_sink
//!                           |                           +-> network_queue -> [convert] -> encoder -> muxer -> network_sink
//! ```

use std::sync::Arc;

use livemix_common::error::{LivemixError, LivemixResult};

use crate::format::FormatContract;
use crate::graph::Graph;
use crate::layout::{Background, Placement};
use crate::port::{Direction, PortId, StageId};
use crate::provider::CapabilityProvider;
use crate::queue::QueueConfig;
use crate::stage::{OptionValue, StageKind};

pub type StageOptions = Vec<(String, OptionValue)>;

/// One capture source and where it lands on the canvas.
#[derive(Debug, Clone, Default)]
pub struct SourceSpec {
    pub options: StageOptions,
    pub placement: Placement,
}

#[derive(Debug, Clone, Default)]
pub struct PlaybackSpec {
    pub queue: QueueConfig,
    pub sink: StageOptions,
}

#[derive(Debug, Clone, Default)]
pub struct PublishSpec {
    pub queue: QueueConfig,
    pub encoder: StageOptions,
    pub sink: StageOptions,
}

/// Everything needed to assemble a broadcast graph for N sources.
#[derive(Debug, Clone)]
pub struct TopologySpec {
    pub sources: Vec<SourceSpec>,
    /// Forced on every capture output so all compositor inputs match.
    pub capture_contract: FormatContract,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub background: Background,
    pub playback: PlaybackSpec,
    pub publish: PublishSpec,
}

/// A built graph with handles to its interesting parts.
#[derive(Debug)]
pub struct BroadcastGraph {
    pub graph: Graph,
    pub sources: Vec<StageId>,
    pub compositor: StageId,
    /// Compositor inputs, in source order.
    pub compositor_inputs: Vec<PortId>,
    pub junction: StageId,
    pub playback_port: PortId,
    pub publish_port: PortId,
}

pub struct GraphBuilder {
    name: String,
    provider: Arc<dyn CapabilityProvider>,
}

fn options(opts: &StageOptions) -> impl Iterator<Item = (&str, OptionValue)> {
    opts.iter().map(|(k, v)| (k.as_str(), v.clone()))
}

fn queue_options(config: QueueConfig) -> [(&'static str, OptionValue); 2] {
    [
        ("max-size-buffers", OptionValue::Int(config.capacity as i64)),
        ("leaky", OptionValue::from(config.leaky.as_str())),
    ]
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, provider: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
        }
    }

    /// Build and link the whole topology. On any error the partially built
    /// graph is torn down and every requested port released.
    pub fn build(&self, spec: &TopologySpec) -> LivemixResult<BroadcastGraph> {
        if spec.sources.is_empty() {
            return Err(LivemixError::config("at least one capture source is required"));
        }
        let mut graph = Graph::new(&self.name, self.provider.clone());

        let compositor = graph.add_stage(
            StageKind::Compositor,
            "compositor",
            [
                ("width", OptionValue::from(spec.canvas_width)),
                ("height", OptionValue::from(spec.canvas_height)),
                ("background", OptionValue::from(spec.background.as_str())),
            ],
        )?;

        let mut sources = Vec::with_capacity(spec.sources.len());
        let mut compositor_inputs = Vec::with_capacity(spec.sources.len());
        for (i, source) in spec.sources.iter().enumerate() {
            let capture = graph.add_stage(
                StageKind::Capture,
                &format!("capture{i}"),
                options(&source.options),
            )?;
            let overlay = graph.add_stage(StageKind::Overlay, &format!("overlay{i}"), [])?;
            graph.link_stages_with_contract(capture, overlay, spec.capture_contract)?;
            let link = graph.link_stages(overlay, compositor)?;
            let input = graph
                .connection(link)
                .map(|c| c.downstream)
                .ok_or_else(|| LivemixError::invalid_port(format!("{link} vanished")))?;
            graph.set_placement(input, source.placement)?;
            sources.push(capture);
            compositor_inputs.push(input);
        }

        let junction = graph.add_stage(StageKind::Junction, "junction", [])?;
        graph.link_stages(compositor, junction)?;

        let playback_lease = graph.request_output_port(junction)?;
        let playback_queue = graph.add_stage(
            StageKind::Queue,
            "playback_queue",
            queue_options(spec.playback.queue),
        )?;
        graph.link(playback_lease.port(), input_port(&graph, playback_queue)?)?;
        let playback_sink = graph.add_stage(
            StageKind::LocalSink,
            "playback_sink",
            options(&spec.playback.sink),
        )?;
        link_negotiated(&mut graph, playback_queue, playback_sink, "playback_convert")?;

        let publish_lease = graph.request_output_port(junction)?;
        let network_queue = graph.add_stage(
            StageKind::Queue,
            "network_queue",
            queue_options(spec.publish.queue),
        )?;
        graph.link(publish_lease.port(), input_port(&graph, network_queue)?)?;
        let encoder = graph.add_stage(StageKind::Encoder, "encoder", options(&spec.publish.encoder))?;
        let muxer = graph.add_stage(StageKind::Muxer, "muxer", [])?;
        let network_sink = graph.add_stage(
            StageKind::NetworkSink,
            "network_sink",
            options(&spec.publish.sink),
        )?;
        link_negotiated(&mut graph, network_queue, encoder, "network_convert")?;
        graph.link_many(&[encoder, muxer, network_sink])?;

        graph.check_complete()?;
        tracing::info!(
            sources = sources.len(),
            stages = graph.stages().count(),
            links = graph.connections().count(),
            "Graph built"
        );

        Ok(BroadcastGraph {
            sources,
            compositor,
            compositor_inputs,
            junction,
            playback_port: playback_lease.into_port(),
            publish_port: publish_lease.into_port(),
            graph,
        })
    }
}

fn input_port(graph: &Graph, stage: StageId) -> LivemixResult<PortId> {
    graph
        .ports_of(stage)
        .into_iter()
        .find(|p| p.direction() == Direction::Input && !p.is_connected())
        .map(|p| p.id())
        .ok_or_else(|| LivemixError::invalid_port(format!("{stage} has no free input")))
}

/// Link two stages, inserting a convert stage named `convert_name` when
/// they share no format.
pub fn link_negotiated(
    graph: &mut Graph,
    upstream: StageId,
    downstream: StageId,
    convert_name: &str,
) -> LivemixResult<()> {
    match graph.link_stages(upstream, downstream) {
        Ok(_) => Ok(()),
        Err(LivemixError::NoCommonFormat {
            upstream: up,
            downstream: down,
        }) => {
            tracing::debug!(upstream = %up, downstream = %down, convert = convert_name, "Inserting conversion");
            let convert = graph.add_stage(StageKind::Convert, convert_name, [])?;
            graph.link_stages(upstream, convert)?;
            graph.link_stages(convert, downstream)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::controller::{ControllerConfig, LifecycleController, StopReason};
    use crate::format::{Encoding, Fraction, PixelFormat};
    use crate::graph::GraphState;
    use crate::queue::Leaky;
    use crate::test_support::{standard_contract, MockProvider};

    fn spec(sources: usize) -> TopologySpec {
        let placements = [(0, 0), (640, 0), (360, 360)];
        TopologySpec {
            sources: (0..sources)
                .map(|i| SourceSpec {
                    options: Vec::new(),
                    placement: {
                        let (x, y) = placements[i % placements.len()];
                        Placement::new(x, y)
                    },
                })
                .collect(),
            capture_contract: standard_contract(),
            canvas_width: 640,
            canvas_height: 360,
            background: Background::Black,
            playback: PlaybackSpec {
                queue: QueueConfig::new(5, Leaky::Downstream),
                sink: Vec::new(),
            },
            publish: PublishSpec {
                queue: QueueConfig::new(5, Leaky::Downstream),
                encoder: vec![
                    ("bitrate".into(), OptionValue::Int(3000)),
                    ("key-int-max".into(), OptionValue::Int(15)),
                    ("speed-preset".into(), OptionValue::Int(1)),
                    ("tune".into(), OptionValue::Int(4)),
                ],
                sink: vec![("location".into(), OptionValue::from("rtmp://localhost/live"))],
            },
        }
    }

    fn contract_into(graph: &Graph, stage: &str) -> FormatContract {
        let id = graph.stage_id(stage).unwrap();
        graph.stage_config(id).unwrap().input_contract().unwrap()
    }

    #[test]
    fn test_builds_three_source_topology() {
        let built = GraphBuilder::new("livemix", MockProvider::new().shared())
            .build(&spec(3))
            .unwrap();
        let g = &built.graph;
        for name in [
            "capture0", "overlay2", "compositor", "junction", "playback_queue",
            "playback_convert", "playback_sink", "network_queue", "encoder", "muxer", "network_sink",
        ] {
            assert!(g.stage_id(name).is_some(), "missing {name}");
        }
        // The encoder takes I420 directly.
        assert!(g.stage_id("network_convert").is_none());

        for i in 0..3 {
            assert_eq!(contract_into(g, &format!("overlay{i}")), standard_contract());
        }
        assert_eq!(contract_into(g, "junction"), standard_contract());
        assert_eq!(
            contract_into(g, "playback_sink").encoding,
            Encoding::Raw(PixelFormat::Rgba)
        );
        let mux_in = contract_into(g, "muxer");
        assert_eq!(mux_in.encoding, Encoding::H264);
        assert_eq!((mux_in.width, mux_in.height), (640, 360));
        assert_eq!(contract_into(g, "network_sink").encoding, Encoding::Flv);

        assert_eq!(g.port(built.playback_port).unwrap().name(), "src_0");
        assert_eq!(g.port(built.publish_port).unwrap().name(), "src_1");
        assert_eq!(g.placement(built.compositor_inputs[2]), Some(Placement::new(360, 360)));
        assert!(g.unconnected_mandatory().is_empty());

        let encoder = g.stage(g.stage_id("encoder").unwrap()).unwrap();
        assert_eq!(encoder.option("tune"), Some(&OptionValue::from("zerolatency")));
        assert_eq!(encoder.option("speed-preset"), Some(&OptionValue::from("ultrafast")));
    }

    #[test]
    fn test_generalizes_to_n_sources() {
        for n in [1, 2, 5] {
            let built = GraphBuilder::new("livemix", MockProvider::new().shared())
                .build(&spec(n))
                .unwrap();
            assert_eq!(built.sources.len(), n);
            assert_eq!(built.compositor_inputs.len(), n);
            let layout = built.graph.layout(built.compositor).unwrap();
            assert_eq!(layout.read().inputs().len(), n);
        }
    }

    #[test]
    fn test_zero_sources_rejected() {
        let err = GraphBuilder::new("livemix", MockProvider::new().shared())
            .build(&spec(0))
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_heterogeneous_capture_contract_fails_link() {
        let mut bad = spec(2);
        bad.capture_contract = FormatContract::raw(PixelFormat::I420, 640, 360, Fraction::new(30, 1))
            .with_encoding(Encoding::H264);
        let err = GraphBuilder::new("livemix", MockProvider::new().shared())
            .build(&bad)
            .unwrap_err();
        assert!(matches!(err, LivemixError::IncompatibleFormat { .. }));
    }

    #[test]
    fn test_invalid_encoder_option_fails_construction() {
        let mut bad = spec(1);
        bad.publish.encoder = vec![("bitrate".into(), OptionValue::Int(-3000))];
        let err = GraphBuilder::new("livemix", MockProvider::new().shared())
            .build(&bad)
            .unwrap_err();
        assert!(matches!(err, LivemixError::InvalidOption { .. }));
    }

    #[tokio::test]
    async fn test_both_branches_receive_data() {
        let provider = MockProvider::new();
        let tally = provider.tally();
        let built = GraphBuilder::new("livemix", provider.shared())
            .build(&spec(3))
            .unwrap();
        let mut controller = LifecycleController::new(built.graph, ControllerConfig::default());
        controller.play().await.unwrap();
        assert_eq!(controller.state(), GraphState::Playing);

        // Placement edits are accepted while playing.
        controller
            .graph_mut()
            .set_placement(built.compositor_inputs[0], Placement::new(10_000, 10_000))
            .unwrap();

        let outcome = controller
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(outcome.reason, StopReason::Shutdown);
        assert!(tally.received("playback_sink") > 0);
        assert!(tally.received("network_sink") > 0);
        let junction_ports: Vec<&String> = outcome
            .report
            .released_ports
            .iter()
            .filter(|p| p.starts_with("junction."))
            .collect();
        assert_eq!(junction_ports, vec!["junction.src_0", "junction.src_1"]);
        assert_eq!(outcome.report.released_ports.len(), 5);
        let first = outcome.report.destroyed_stages.first().unwrap();
        assert!(first == "playback_sink" || first == "network_sink");
    }
}
