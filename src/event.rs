//! Consumer notifications and display mode changes.
//!
//! The event channel is a single coalescing slot, not a queue: notifications
//! raised between two waits are OR-ed together and delivered once, with the
//! latest power value. A consumer that falls behind therefore never sees a
//! backlog, only the final state.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{RelayError, Result};
use crate::frame_clock::DEFAULT_REFRESH_HZ;
use crate::power::PowerState;

bitflags! {
    /// Notification bits delivered by `signal_wait`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        /// A new record is waiting in `active`.
        const PRESENT_READY = 1 << 0;
        /// The power value changed.
        const POWER_CHANGED = 1 << 1;
    }
}

/// One coalesced delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayEvent {
    pub flags: EventFlags,
    pub power: PowerState,
}

impl RelayEvent {
    pub fn present_ready(&self) -> bool {
        self.flags.contains(EventFlags::PRESENT_READY)
    }

    pub fn power_changed(&self) -> bool {
        self.flags.contains(EventFlags::POWER_CHANGED)
    }
}

#[derive(Debug)]
struct EventState {
    flags: EventFlags,
    power: PowerState,
    torn_down: bool,
}

/// Event channel owned by one consumer registration.
#[derive(Debug)]
pub struct EventChannel {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventChannel {
    pub fn new(power: PowerState) -> Self {
        Self {
            state: Mutex::new(EventState {
                flags: EventFlags::empty(),
                power,
                torn_down: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Raise `flags`, optionally updating the power value, and wake waiters.
    pub fn notify(&self, flags: EventFlags, power: Option<PowerState>) {
        let mut state = self.state.lock().unwrap();
        if state.torn_down {
            return;
        }
        state.flags |= flags;
        if let Some(power) = power {
            state.power = power;
        }
        self.cond.notify_all();
    }

    pub fn notify_present(&self, count: usize) {
        trace!(count, "present ready");
        self.notify(EventFlags::PRESENT_READY, None);
    }

    pub fn notify_power(&self, power: PowerState) {
        debug!(?power, "power changed");
        self.notify(EventFlags::POWER_CHANGED, Some(power));
    }

    /// Block until something was raised or the registration is torn down.
    pub fn signal_wait(&self) -> Result<RelayEvent> {
        let state = self.state.lock().unwrap();
        let mut state = self
            .cond
            .wait_while(state, |s| s.flags.is_empty() && !s.torn_down)
            .unwrap();
        Self::take(&mut state).ok_or(RelayError::Disconnected)
    }

    /// Like `signal_wait`, but gives up after `timeout` with `Ok(None)`.
    pub fn signal_wait_timeout(&self, timeout: Duration) -> Result<Option<RelayEvent>> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.flags.is_empty() && !s.torn_down)
            .unwrap();
        if state.torn_down {
            return Err(RelayError::Disconnected);
        }
        Ok(Self::take(&mut state))
    }

    fn take(state: &mut EventState) -> Option<RelayEvent> {
        if state.torn_down || state.flags.is_empty() {
            return None;
        }
        let flags = std::mem::take(&mut state.flags);
        Some(RelayEvent {
            flags,
            power: state.power,
        })
    }

    /// Fail every current and future wait with `Disconnected`.
    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.torn_down = true;
        state.flags = EventFlags::empty();
        self.cond.notify_all();
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.lock().unwrap().torn_down
    }
}

/// Display mode negotiated by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    /// Hz
    pub refresh: u32,
}

impl Default for DisplayMode {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh: DEFAULT_REFRESH_HZ,
        }
    }
}

impl DisplayMode {
    /// Validate a mode as requested over the wire.
    ///
    /// A non-positive refresh rate falls back to 60 Hz.
    pub fn from_request(width: i32, height: i32, refresh: i32) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(RelayError::InvalidArgument("mode size must be positive"));
        }
        let refresh = if refresh > 0 {
            refresh as u32
        } else {
            DEFAULT_REFRESH_HZ
        };
        Ok(Self {
            width: width as u32,
            height: height as u32,
            refresh,
        })
    }
}

/// Display-change observers, notified when the mode actually changes.
#[derive(Debug, Default)]
pub struct ModeObservers {
    senders: Mutex<Vec<Sender<DisplayMode>>>,
}

impl ModeObservers {
    pub fn subscribe(&self) -> Receiver<DisplayMode> {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    /// Deliver `mode` to every live observer, forgetting dropped ones.
    pub fn broadcast(&self, mode: DisplayMode) {
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(mode).is_ok());
    }
}
