//! Mock stage kinds for exercising the graph and controller without real
//! media processing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use livemix_common::error::{LivemixError, LivemixResult};

use crate::buffer::{Buffer, EncodedUnit, Payload, VideoFrameMut};
use crate::format::{Caps, Encoding, FormatContract, FormatTemplate, Fraction, PixelFormat};
use crate::graph::Graph;
use crate::junction::{junction_descriptor, JunctionFactory};
use crate::layout::Background;
use crate::port::Direction;
use crate::processor::{Processor, StageConfig, StageContext, StageIo};
use crate::provider::{CapabilityProvider, StageFactory};
use crate::queue::{queue_descriptor, QueueFactory};
use crate::stage::{CapsRule, OptionSpec, PortTemplate, StageDescriptor, StageKind};

pub(crate) const SPEED_PRESETS: &[(&str, i64)] = &[("none", 0), ("ultrafast", 1), ("medium", 6)];
pub(crate) const TUNES: &[(&str, i64)] = &[("none", 0), ("zerolatency", 4)];

pub(crate) fn standard_contract() -> FormatContract {
    FormatContract::raw(PixelFormat::I420, 640, 360, Fraction::new(30, 1))
}

/// Counts what each sink received.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    received: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl Tally {
    fn counter(&self, stage: &str) -> Arc<AtomicU64> {
        self.received
            .lock()
            .entry(stage.to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn received(&self, stage: &str) -> u64 {
        self.counter(stage).load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct MockProvider {
    source_frames: Option<u64>,
    fault_after: HashMap<String, u64>,
    acquire_failures: HashSet<String>,
    acquire_hangs: HashSet<String>,
    tally: Arc<Tally>,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_source_frames(mut self, frames: u64) -> Self {
        self.source_frames = Some(frames);
        self
    }

    pub(crate) fn with_fault_after(mut self, stage: &str, units: u64) -> Self {
        self.fault_after.insert(stage.to_string(), units);
        self
    }

    pub(crate) fn with_acquire_failure(mut self, stage: &str) -> Self {
        self.acquire_failures.insert(stage.to_string());
        self
    }

    pub(crate) fn with_acquire_hang(mut self, stage: &str) -> Self {
        self.acquire_hangs.insert(stage.to_string());
        self
    }

    pub(crate) fn tally(&self) -> Arc<Tally> {
        self.tally.clone()
    }

    pub(crate) fn shared(self) -> Arc<dyn CapabilityProvider> {
        Arc::new(self)
    }
}

pub(crate) fn mock_provider() -> Arc<dyn CapabilityProvider> {
    MockProvider::new().shared()
}

fn raw(formats: &[PixelFormat]) -> Caps {
    Caps::from(FormatTemplate::raw(formats))
}

fn encoded(encoding: Encoding) -> Caps {
    Caps::from(FormatTemplate::new(vec![encoding]))
}

fn mock_descriptor(kind: StageKind) -> StageDescriptor {
    let input = |caps| PortTemplate::always("sink", Direction::Input, caps);
    let output = |caps| PortTemplate::always("src", Direction::Output, caps);
    match kind {
        StageKind::Capture => StageDescriptor::new(kind, "mock source")
            .port(output(Caps::any_raw()))
            .option(OptionSpec::int("num-buffers", -1, i64::MAX, -1, "frames")),
        StageKind::Overlay => StageDescriptor::new(kind, "mock overlay")
            .port(input(Caps::any_raw()))
            .port(output(Caps::any_raw()))
            .caps_rule(CapsRule::Passthrough),
        StageKind::Compositor => StageDescriptor::new(kind, "mock compositor")
            .port(PortTemplate::request("sink_%u", Direction::Input, raw(&[PixelFormat::I420])).required(1))
            .port(output(raw(&[PixelFormat::I420])))
            .option(OptionSpec::int("width", 1, 16384, 640, "canvas width"))
            .option(OptionSpec::int("height", 1, 16384, 360, "canvas height"))
            .option(OptionSpec::enumeration("background", Background::VALUES, "black", "bg"))
            .caps_rule(CapsRule::Canvas),
        StageKind::Junction => junction_descriptor(),
        StageKind::Queue => queue_descriptor(),
        StageKind::Convert => StageDescriptor::new(kind, "mock convert")
            .port(input(Caps::any_raw()))
            .port(output(Caps::any_raw()))
            .caps_rule(CapsRule::Geometry),
        StageKind::Encoder => StageDescriptor::new(kind, "mock encoder")
            .port(input(raw(&[PixelFormat::I420])))
            .port(output(encoded(Encoding::H264)))
            .option(OptionSpec::int("bitrate", 1, 2_048_000, 2048, "kbit/s"))
            .option(OptionSpec::int("key-int-max", 0, i64::from(i32::MAX), 0, "gop"))
            .option(OptionSpec::enumeration("speed-preset", SPEED_PRESETS, "medium", "preset"))
            .option(OptionSpec::enumeration("tune", TUNES, "none", "tune"))
            .caps_rule(CapsRule::Geometry),
        StageKind::Muxer => StageDescriptor::new(kind, "mock muxer")
            .port(input(encoded(Encoding::H264)))
            .port(output(encoded(Encoding::Flv)))
            .caps_rule(CapsRule::Geometry),
        StageKind::NetworkSink => StageDescriptor::new(kind, "mock network sink")
            .port(input(encoded(Encoding::Flv)))
            .option(OptionSpec::string("location", "", "uri")),
        StageKind::LocalSink => StageDescriptor::new(kind, "mock local sink")
            .port(input(raw(&[PixelFormat::Rgba, PixelFormat::Bgra])))
            .option(OptionSpec::boolean("sync", false, "sync")),
    }
}

impl CapabilityProvider for MockProvider {
    fn describe(&self, kind: StageKind) -> Option<Arc<StageDescriptor>> {
        Some(Arc::new(mock_descriptor(kind)))
    }

    fn instantiate(&self, config: &StageConfig) -> LivemixResult<Box<dyn Processor>> {
        match config.kind {
            StageKind::Junction => return JunctionFactory::new().create(config).map_err(LivemixError::Other),
            StageKind::Queue => return QueueFactory::new().create(config).map_err(LivemixError::Other),
            _ => {}
        }
        let role = if config.inputs.is_empty() {
            Role::Source {
                frames: self.source_frames,
                contract: config.output_contract().map_err(LivemixError::Other)?,
            }
        } else if config.outputs.is_empty() {
            Role::Sink(self.tally.counter(&config.name))
        } else {
            Role::Filter
        };
        Ok(Box::new(MockProcessor {
            role,
            fault_after: self.fault_after.get(&config.name).copied(),
            fail_acquire: self.acquire_failures.contains(&config.name),
            hang_acquire: self.acquire_hangs.contains(&config.name),
        }))
    }

    fn kinds(&self) -> Vec<StageKind> {
        StageKind::ALL.to_vec()
    }
}

enum Role {
    Source {
        frames: Option<u64>,
        contract: FormatContract,
    },
    Filter,
    Sink(Arc<AtomicU64>),
}

struct MockProcessor {
    role: Role,
    fault_after: Option<u64>,
    fail_acquire: bool,
    hang_acquire: bool,
}

fn mock_payload(contract: &FormatContract) -> Payload {
    match contract.pixel_format() {
        Some(format) => Payload::Video(VideoFrameMut::zeroed(format, contract.width, contract.height).freeze()),
        None => Payload::Encoded(EncodedUnit {
            keyframe: true,
            codec_data: None,
            data: bytes::Bytes::from_static(&[0, 0, 0, 1]),
        }),
    }
}

#[async_trait]
impl Processor for MockProcessor {
    async fn acquire(&mut self) -> anyhow::Result<()> {
        if self.hang_acquire {
            std::future::pending::<()>().await;
        }
        anyhow::ensure!(!self.fail_acquire, "Could not open resource for writing.");
        Ok(())
    }

    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        match self.role {
            Role::Source { frames, contract } => {
                let output = io.into_output()?;
                let mut sequence = 0u64;
                while frames.map_or(true, |n| sequence < n) {
                    let buffer = Buffer {
                        pts_ns: sequence * 1_000_000,
                        duration_ns: 1_000_000,
                        sequence,
                        payload: mock_payload(&contract),
                    };
                    if !output.push(buffer, &ctx.stop).is_flowing() {
                        break;
                    }
                    if sequence == 0 {
                        ctx.reporter.first_buffer();
                    }
                    sequence += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
            Role::Filter => {
                let (input, output) = io.into_single()?;
                let mut forwarded = 0u64;
                while let Some(buffer) = input.pop(&ctx.stop) {
                    if self.fault_after.is_some_and(|n| forwarded >= n) {
                        anyhow::bail!("mock failure after {forwarded} buffers");
                    }
                    if !output.push(buffer, &ctx.stop).is_flowing() {
                        break;
                    }
                    forwarded += 1;
                }
                Ok(())
            }
            Role::Sink(counter) => {
                let input = io.into_input()?;
                while let Some(_buffer) = input.pop(&ctx.stop) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }
    }
}

/// `source -> overlay -> sink` carrying a small RGBA contract.
pub(crate) fn linear_graph(provider: Arc<dyn CapabilityProvider>) -> Graph {
    let mut graph = Graph::new("linear", provider);
    let source = graph.add_stage(StageKind::Capture, "source", []).unwrap();
    let overlay = graph.add_stage(StageKind::Overlay, "overlay", []).unwrap();
    let sink = graph.add_stage(StageKind::LocalSink, "sink", []).unwrap();
    let contract = FormatContract::raw(PixelFormat::Rgba, 64, 36, Fraction::new(30, 1));
    graph
        .link_stages_with_contract(source, overlay, contract)
        .unwrap();
    graph.link_stages(overlay, sink).unwrap();
    graph
}
