//! Bounded link queues and the queue stage.
//!
//! Every connection of a playing graph is backed by one bounded queue, the
//! only hand-off between stage threads. Leaky queues drop their oldest unit
//! when full so a slow consumer never stalls its producer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use livemix_common::error::{LivemixError, LivemixResult};

use crate::buffer::Buffer;
use crate::format::Caps;
use crate::port::Direction;
use crate::processor::{Processor, StageConfig, StageContext, StageIo, StopFlag};
use crate::provider::StageFactory;
use crate::stage::{CapsRule, OptionSpec, PortTemplate, Stage, StageDescriptor, StageKind};

/// How long a blocked push or pop waits before checking the stop flag again.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Units queued on a plain connection.
pub const DEFAULT_LINK_CAPACITY: usize = 2;

/// What a full queue does with a new unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Leaky {
    /// Block the producer until there is room.
    #[default]
    No,
    /// Drop the oldest queued unit.
    Downstream,
}

impl Leaky {
    pub const VALUES: &'static [(&'static str, i64)] = &[("no", 0), ("downstream", 2)];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Downstream => "downstream",
        }
    }

    fn from_nick(nick: &str) -> Option<Self> {
        match nick {
            "no" => Some(Self::No),
            "downstream" => Some(Self::Downstream),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub leaky: Leaky,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LINK_CAPACITY,
            leaky: Leaky::No,
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize, leaky: Leaky) -> Self {
        Self {
            capacity: capacity.max(1),
            leaky,
        }
    }

    /// Queue backing a connection that leaves `upstream`.
    ///
    /// Junction branches hold at most one unit and drop the oldest; a queue
    /// stage's output uses the stage's own settings.
    pub fn for_link(upstream: &Stage) -> LivemixResult<Self> {
        match upstream.kind() {
            StageKind::Junction => Ok(Self::new(1, Leaky::Downstream)),
            StageKind::Queue => Self::from_queue_stage(upstream),
            _ => Ok(Self::default()),
        }
    }

    fn from_queue_stage(stage: &Stage) -> LivemixResult<Self> {
        let capacity = stage
            .option("max-size-buffers")
            .and_then(|v| v.as_int())
            .ok_or_else(|| {
                LivemixError::invalid_option(stage.name(), "max-size-buffers", "missing value")
            })?;
        let leaky = stage
            .option("leaky")
            .and_then(|v| v.as_str())
            .and_then(Leaky::from_nick)
            .ok_or_else(|| LivemixError::invalid_option(stage.name(), "leaky", "missing value"))?;
        Ok(Self::new(capacity.max(1) as usize, leaky))
    }
}

/// Per-connection counters.
#[derive(Debug, Default)]
pub struct LinkStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
    popped: AtomicU64,
    closed: AtomicBool,
}

impl LinkStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest unit.
    DroppedOldest,
    /// The consumer has gone away.
    Disconnected,
    /// The graph is stopping; the unit was discarded.
    Stopped,
}

impl PushOutcome {
    /// Whether the producer should keep going.
    pub fn is_flowing(&self) -> bool {
        matches!(self, Self::Queued | Self::DroppedOldest)
    }
}

/// Producer end of a link queue.
#[derive(Debug)]
pub struct LinkSender {
    tx: Sender<Buffer>,
    /// Used to evict the oldest unit of a leaky queue.
    evict: Option<Receiver<Buffer>>,
    stats: Arc<LinkStats>,
}

/// Consumer end of a link queue. Dropping it disconnects the producer.
#[derive(Debug)]
pub struct LinkReceiver {
    rx: Receiver<Buffer>,
    stats: Arc<LinkStats>,
}

pub fn link_queue(config: QueueConfig) -> (LinkSender, LinkReceiver, Arc<LinkStats>) {
    let (tx, rx) = crossbeam_channel::bounded(config.capacity.max(1));
    let stats = Arc::new(LinkStats::default());
    let evict = (config.leaky == Leaky::Downstream).then(|| rx.clone());
    (
        LinkSender {
            tx,
            evict,
            stats: stats.clone(),
        },
        LinkReceiver {
            rx,
            stats: stats.clone(),
        },
        stats,
    )
}

impl LinkSender {
    /// Queue a unit. Never blocks on a leaky queue; a non-leaky queue blocks
    /// until there is room or `stop` is raised.
    pub fn push(&self, buffer: Buffer, stop: &StopFlag) -> PushOutcome {
        if stop.is_stopped() {
            return PushOutcome::Stopped;
        }
        if self.stats.closed.load(Ordering::Acquire) {
            return PushOutcome::Disconnected;
        }
        let outcome = match &self.evict {
            Some(evict) => self.push_leaky(buffer, evict),
            None => self.push_blocking(buffer, stop),
        };
        if outcome.is_flowing() {
            self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn push_leaky(&self, mut buffer: Buffer, evict: &Receiver<Buffer>) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;
        loop {
            match self.tx.try_send(buffer) {
                Ok(()) => return outcome,
                Err(TrySendError::Full(b)) => {
                    buffer = b;
                    if evict.try_recv().is_ok() {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        outcome = PushOutcome::DroppedOldest;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Disconnected,
            }
        }
    }

    fn push_blocking(&self, mut buffer: Buffer, stop: &StopFlag) -> PushOutcome {
        loop {
            match self.tx.send_timeout(buffer, POLL_INTERVAL) {
                Ok(()) => return PushOutcome::Queued,
                Err(SendTimeoutError::Timeout(b)) => {
                    if stop.is_stopped() {
                        return PushOutcome::Stopped;
                    }
                    if self.stats.closed.load(Ordering::Acquire) {
                        return PushOutcome::Disconnected;
                    }
                    buffer = b;
                }
                Err(SendTimeoutError::Disconnected(_)) => return PushOutcome::Disconnected,
            }
        }
    }
}

impl LinkReceiver {
    /// Wait for the next unit. Returns `None` once the producer has finished
    /// and the queue is drained, or when `stop` is raised.
    pub fn pop(&self, stop: &StopFlag) -> Option<Buffer> {
        loop {
            if stop.is_stopped() {
                return None;
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(buffer) => {
                    self.stats.popped.fetch_add(1, Ordering::Relaxed);
                    return Some(buffer);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Take a unit if one is waiting.
    pub fn try_pop(&self) -> Option<Buffer> {
        let buffer = self.rx.try_recv().ok()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(buffer)
    }
}

impl Drop for LinkReceiver {
    fn drop(&mut self) {
        self.stats.closed.store(true, Ordering::Release);
    }
}

pub(crate) fn queue_descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::Queue, "Bounded hand-off between threads")
        .port(PortTemplate::always("sink", Direction::Input, Caps::any()))
        .port(PortTemplate::always("src", Direction::Output, Caps::any()))
        .option(OptionSpec::int(
            "max-size-buffers",
            1,
            10_000,
            200,
            "Max. number of buffers in the queue",
        ))
        .option(OptionSpec::enumeration(
            "leaky",
            Leaky::VALUES,
            "no",
            "Where the queue leaks, if at all",
        ))
        .caps_rule(CapsRule::Passthrough)
}

pub struct QueueFactory {
    descriptor: Arc<StageDescriptor>,
}

impl QueueFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(queue_descriptor()),
        }
    }
}

impl Default for QueueFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for QueueFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, _config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        Ok(Box::new(QueueProcessor))
    }
}

/// Moves units from its input link to its output link on its own thread.
struct QueueProcessor;

impl Processor for QueueProcessor {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let (input, output) = io.into_single()?;
        while let Some(buffer) = input.pop(&ctx.stop) {
            match output.push(buffer, &ctx.stop) {
                PushOutcome::DroppedOldest => {
                    tracing::trace!(stage = %ctx.name, "Queue full, dropped oldest buffer")
                }
                PushOutcome::Queued => {}
                PushOutcome::Disconnected | PushOutcome::Stopped => break,
            }
        }
        Ok(())
    }
}
