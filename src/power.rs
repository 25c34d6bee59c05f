//! Display power (DPMS) sequencing.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pacer::VblankPacer;
use crate::record::RelaySlots;

/// Power state as seen by the consumer.
///
/// `NoConsumer` is not a screen state: it tells the consumer that the
/// producer side went away and cached buffers can no longer be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Off,
    On,
    NoConsumer,
}

impl PowerState {
    /// Wire value: Off=0, On=1, NoConsumer=2.
    pub fn to_raw(self) -> u32 {
        match self {
            PowerState::Off => 0,
            PowerState::On => 1,
            PowerState::NoConsumer => 2,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PowerState::Off),
            1 => Some(PowerState::On),
            2 => Some(PowerState::NoConsumer),
            _ => None,
        }
    }
}

/// Single writer of the device power state.
#[derive(Debug)]
pub struct PowerSequencer {
    state: AtomicU8,
}

impl Default for PowerSequencer {
    fn default() -> Self {
        Self::new(PowerState::On)
    }
}

impl PowerSequencer {
    pub fn new(initial: PowerState) -> Self {
        Self {
            state: AtomicU8::new(initial.to_raw() as u8),
        }
    }

    pub fn current(&self) -> PowerState {
        PowerState::from_raw(u32::from(self.state.load(Ordering::Acquire)))
            .unwrap_or(PowerState::Off)
    }

    /// Apply the relay side of a transition and return the previous state.
    ///
    /// Off drops both in-flight records and disarms the pacer. On leaves the
    /// pacer alone; the next commit arms it. NoConsumer only changes state.
    /// The caller notifies the consumer.
    pub fn enter(&self, target: PowerState, slots: &RelaySlots, pacer: &VblankPacer) -> PowerState {
        let released = if target == PowerState::Off {
            pacer.halt(slots)
        } else {
            Vec::new()
        };
        let previous = self.state.swap(target.to_raw() as u8, Ordering::AcqRel);
        drop(released);
        let previous = PowerState::from_raw(u32::from(previous)).unwrap_or(PowerState::Off);
        debug!(?previous, ?target, "power transition");
        previous
    }
}
