//! Asynchronous fault and event delivery from stage threads to the
//! dispatch loop.

use std::fmt;

use livemix_common::clock::PipelineClock;
use livemix_common::error::LivemixError;
use tokio::sync::mpsc;

/// A fault raised by a live stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub stage: String,
    pub message: String,
    pub detail: Option<String>,
    /// Pipeline running time when the fault was raised.
    pub running_time_ns: u64,
}

impl FaultEvent {
    pub fn into_error(self) -> LivemixError {
        LivemixError::RuntimeFault {
            stage: self.stage,
            message: self.message,
            detail: self.detail,
        }
    }
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error received from stage {}: {}", self.stage, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDebugging information: {detail}")?;
        }
        Ok(())
    }
}

/// Everything stages can post to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Fault(FaultEvent),
    Warning { stage: String, message: String },
    /// A sink has consumed its last unit.
    EndOfStream { stage: String },
    /// A stage produced its first unit.
    FirstBuffer { stage: String, running_time_ns: u64 },
}

/// Posts bus messages on behalf of one stage. Cheap to clone and usable
/// from any thread.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<BusMessage>,
    stage: String,
    clock: Option<PipelineClock>,
}

/// The dispatch loop's end of the bus.
#[derive(Debug)]
pub struct BusReceiver {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

/// Create a bus. The returned reporter is not bound to any stage.
pub fn bus() -> (FaultReporter, BusReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FaultReporter {
            tx,
            stage: String::new(),
            clock: None,
        },
        BusReceiver { rx },
    )
}

impl FaultReporter {
    /// A reporter that stamps messages with `stage` and the shared clock.
    pub fn for_stage(&self, stage: &str, clock: &PipelineClock) -> Self {
        Self {
            tx: self.tx.clone(),
            stage: stage.to_string(),
            clock: Some(clock.clone()),
        }
    }

    fn running_time_ns(&self) -> u64 {
        self.clock.as_ref().map_or(0, PipelineClock::running_time_ns)
    }

    fn post(&self, message: BusMessage) {
        // The receiver is gone only once the controller has been dropped.
        if self.tx.send(message).is_err() {
            tracing::debug!(stage = %self.stage, "Bus closed, message discarded");
        }
    }

    pub fn fault(&self, message: impl Into<String>, detail: Option<String>) {
        self.post(BusMessage::Fault(FaultEvent {
            stage: self.stage.clone(),
            message: message.into(),
            detail,
            running_time_ns: self.running_time_ns(),
        }));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.post(BusMessage::Warning {
            stage: self.stage.clone(),
            message: message.into(),
        });
    }

    pub fn end_of_stream(&self) {
        self.post(BusMessage::EndOfStream {
            stage: self.stage.clone(),
        });
    }

    pub fn first_buffer(&self) {
        self.post(BusMessage::FirstBuffer {
            stage: self.stage.clone(),
            running_time_ns: self.running_time_ns(),
        });
    }
}

impl BusReceiver {
    /// Next message, one at a time.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}
