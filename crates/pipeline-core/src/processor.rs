//! The seam between the graph and the code that actually moves data.
//!
//! A capability provider turns a [`StageConfig`] into a [`Processor`]. The
//! lifecycle controller acquires every processor's resources, hands each one
//! its link queues, and runs it on a dedicated thread until the graph stops.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use livemix_common::clock::PipelineClock;

use crate::buffer::Buffer;
use crate::fault::FaultReporter;
use crate::format::{Fraction, FormatContract};
use crate::layout::SharedLayout;
use crate::port::{PortId, StageId};
use crate::queue::{LinkReceiver, LinkSender, PushOutcome, POLL_INTERVAL};
use crate::stage::{OptionValue, StageKind};

/// Cooperative stop signal shared by every stage thread.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A connected port of a stage as seen by its processor.
#[derive(Debug, Clone)]
pub struct PortBinding {
    pub port: PortId,
    pub name: String,
    pub contract: FormatContract,
}

/// Resolved configuration of one stage, passed to its factory.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub id: StageId,
    pub name: String,
    pub kind: StageKind,
    /// All declared options, defaults filled in.
    pub options: BTreeMap<String, OptionValue>,
    /// Connected inputs in connection order.
    pub inputs: Vec<PortBinding>,
    /// Connected outputs in connection order.
    pub outputs: Vec<PortBinding>,
    /// Shared layout, for compositors.
    pub layout: Option<SharedLayout>,
}

impl StageConfig {
    fn option(&self, key: &str) -> anyhow::Result<&OptionValue> {
        self.options
            .get(key)
            .with_context(|| format!("stage '{}' has no option '{key}'", self.name))
    }

    pub fn option_bool(&self, key: &str) -> anyhow::Result<bool> {
        self.option(key)?
            .as_bool()
            .with_context(|| format!("option '{key}' of '{}' is not a bool", self.name))
    }

    pub fn option_int(&self, key: &str) -> anyhow::Result<i64> {
        self.option(key)?
            .as_int()
            .with_context(|| format!("option '{key}' of '{}' is not an integer", self.name))
    }

    pub fn option_str(&self, key: &str) -> anyhow::Result<&str> {
        self.option(key)?
            .as_str()
            .with_context(|| format!("option '{key}' of '{}' is not a string", self.name))
    }

    pub fn option_fraction(&self, key: &str) -> anyhow::Result<Fraction> {
        self.option(key)?
            .as_fraction()
            .with_context(|| format!("option '{key}' of '{}' is not a fraction", self.name))
    }

    /// Contract of the only connected input.
    pub fn input_contract(&self) -> anyhow::Result<FormatContract> {
        self.inputs
            .first()
            .map(|b| b.contract)
            .with_context(|| format!("stage '{}' has no connected input", self.name))
    }

    /// Contract of the first connected output.
    pub fn output_contract(&self) -> anyhow::Result<FormatContract> {
        self.outputs
            .first()
            .map(|b| b.contract)
            .with_context(|| format!("stage '{}' has no connected output", self.name))
    }
}

/// Receiving end of one input connection.
#[derive(Debug)]
pub struct InputLink {
    pub binding: PortBinding,
    pub(crate) rx: LinkReceiver,
}

impl InputLink {
    pub fn pop(&self, stop: &StopFlag) -> Option<Buffer> {
        self.rx.pop(stop)
    }

    pub fn try_pop(&self) -> Option<Buffer> {
        self.rx.try_pop()
    }
}

/// Sending end of one output connection.
#[derive(Debug)]
pub struct OutputLink {
    pub binding: PortBinding,
    pub(crate) tx: LinkSender,
}

impl OutputLink {
    pub fn push(&self, buffer: Buffer, stop: &StopFlag) -> PushOutcome {
        self.tx.push(buffer, stop)
    }
}

/// The link queues of one stage.
#[derive(Debug, Default)]
pub struct StageIo {
    pub inputs: Vec<InputLink>,
    pub outputs: Vec<OutputLink>,
}

impl StageIo {
    /// For stages with exactly one input and one output.
    pub fn into_single(self) -> anyhow::Result<(InputLink, OutputLink)> {
        let mut inputs = self.inputs.into_iter();
        let mut outputs = self.outputs.into_iter();
        let input = inputs.next().context("no connected input")?;
        let output = outputs.next().context("no connected output")?;
        Ok((input, output))
    }

    /// For sinks.
    pub fn into_input(self) -> anyhow::Result<InputLink> {
        self.inputs.into_iter().next().context("no connected input")
    }

    /// For sources.
    pub fn into_output(self) -> anyhow::Result<OutputLink> {
        self.outputs.into_iter().next().context("no connected output")
    }
}

/// What a running processor may use besides its links.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub name: String,
    pub clock: PipelineClock,
    pub stop: StopFlag,
    pub reporter: FaultReporter,
}

impl StageContext {
    /// Sleep until the pipeline clock reaches `running_time_ns`, waking up
    /// to check the stop flag. Returns `false` if the graph stopped first.
    pub fn wait_until(&self, running_time_ns: u64) -> bool {
        while let Some(left) = self.clock.until(running_time_ns) {
            if self.stop.is_stopped() {
                return false;
            }
            std::thread::sleep(left.min(POLL_INTERVAL));
        }
        !self.stop.is_stopped()
    }
}

/// Data-moving half of a stage.
///
/// `acquire` runs on the dispatch loop during `Ready -> Playing` and must
/// claim any device or socket the stage needs; the controller bounds it with
/// a timeout. `run` then executes on the stage's own thread and returns when
/// the input ends, the stop flag is raised, or a fault occurs. An error from
/// `run` is reported as a runtime fault.
#[async_trait]
pub trait Processor: Send {
    async fn acquire(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()>;
}
