//! Frame clock for the emulated VBlank.
//!
//! Tracks the refresh interval of the current mode, the time of the last
//! emulated VBlank and a monotonic VBlank sequence, which is what producers
//! see as frame acknowledgement.

use std::num::NonZeroU64;
use std::time::{Duration, Instant};

use tracing::warn;

/// Refresh rate used when a mode reports none.
pub const DEFAULT_REFRESH_HZ: u32 = 60;

/// One emulated VBlank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankStamp {
    pub sequence: u64,
    pub time: Instant,
}

#[derive(Debug)]
pub struct FrameClock {
    last_vblank: Option<Instant>,
    refresh_interval_ns: NonZeroU64,
    sequence: u64,
}

fn interval_for(refresh_hz: u32) -> NonZeroU64 {
    let hz = if refresh_hz == 0 {
        warn!("refresh rate of 0 Hz, using {DEFAULT_REFRESH_HZ}");
        DEFAULT_REFRESH_HZ
    } else {
        refresh_hz
    };
    NonZeroU64::new(1_000_000_000 / u64::from(hz)).unwrap_or(NonZeroU64::MIN)
}

impl FrameClock {
    pub fn new(refresh_hz: u32) -> Self {
        Self {
            last_vblank: None,
            refresh_interval_ns: interval_for(refresh_hz),
            sequence: 0,
        }
    }

    pub fn set_refresh_rate(&mut self, refresh_hz: u32) {
        self.refresh_interval_ns = interval_for(refresh_hz);
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_nanos(self.refresh_interval_ns.get())
    }

    /// Record an emulated VBlank at `time`.
    pub fn vblank(&mut self, time: Instant) -> VblankStamp {
        self.sequence = self.sequence.wrapping_add(1);
        self.last_vblank = Some(time);
        VblankStamp {
            sequence: self.sequence,
            time,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn last_vblank(&self) -> Option<Instant> {
        self.last_vblank
    }
}
