//! Clock and timing utilities for stream synchronization.
//!
//! Every stage of a playing graph shares one monotonic clock whose epoch is
//! captured when the graph enters `Playing`. Buffer timestamps are expressed
//! as running time (nanoseconds since that epoch).

use std::time::{Duration, Instant};

/// A pipeline clock that provides monotonic timestamps relative to
/// a fixed epoch (the moment the graph started playing).
#[derive(Debug, Clone)]
pub struct PipelineClock {
    /// The instant playback started.
    epoch: Instant,

    /// Wall-clock time at epoch (ISO 8601 string).
    epoch_wall: String,
}

impl PipelineClock {
    /// Create a new clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Nanoseconds elapsed since the epoch.
    pub fn running_time_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Wall-clock time at the epoch.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// Time left until the given running time is reached, if any.
    pub fn until(&self, running_time_ns: u64) -> Option<Duration> {
        let now = self.running_time_ns();
        (running_time_ns > now).then(|| Duration::from_nanos(running_time_ns - now))
    }
}

/// Maps frame indices onto presentation timestamps for a rational rate.
#[derive(Debug, Clone, Copy)]
pub struct FramePacer {
    num: u64,
    den: u64,
}

impl FramePacer {
    /// Create a pacer for `num/den` frames per second.
    ///
    /// A zero numerator or denominator is treated as 1.
    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num: u64::from(num.max(1)),
            den: u64::from(den.max(1)),
        }
    }

    /// Presentation timestamp of frame `index`.
    pub fn pts_ns(&self, index: u64) -> u64 {
        // Computed from the index rather than accumulated so rounding never drifts.
        (index as u128 * self.den as u128 * 1_000_000_000 / self.num as u128) as u64
    }

    /// Duration of frame `index`.
    pub fn duration_ns(&self, index: u64) -> u64 {
        self.pts_ns(index + 1) - self.pts_ns(index)
    }

    /// Nominal frame interval.
    pub fn interval_ns(&self) -> u64 {
        self.den * 1_000_000_000 / self.num
    }
}
