//! VBlank pacer: retires `pending` into `active` once per refresh interval.
//!
//! # State machine
//!
//! ```text
//!            flush() with pending          tick, nothing raced in
//!   Idle ------------------------> Armed ------------------------> Idle
//!                                   |  ^
//!                                   |  | tick, a commit raced in (re-arm)
//!                                   +--+
//! ```
//!
//! The deadline is always `now + 1/refresh` at the time of arming. The
//! consumer only ever sees the newest frame: everything committed between two
//! ticks collapses into the single record left in `pending`.
//!
//! The state is a single atomic word: 0 while idle, otherwise the armed
//! deadline in nanoseconds since the pacer was created. Commits arm it with a
//! compare-exchange and unpark the timer thread, so the commit path never
//! takes a lock. A tick publishes Idle before it looks at `pending` again,
//! and a commit publishes its record before it looks at the state, so one of
//! the two always sees the other and a raced-in commit is never stranded.
//!
//! Ticks and `halt` are serialized by a lock only they take. Records they
//! displace are dropped after that lock is released.

use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::frame_clock::{FrameClock, VblankStamp};
use crate::record::{PresentRecord, RelaySlots};
use crate::{tracy_frame_mark, tracy_span};

/// Encoded state of an idle pacer.
const IDLE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    Armed { deadline: Instant },
}

/// Result of one tick.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// `(id, count)` of the record moved into `active`, if any.
    pub retired: Option<(u32, usize)>,
    pub vblank: VblankStamp,
    pub rearmed: bool,
}

#[derive(Debug)]
pub struct VblankPacer {
    epoch: Instant,
    /// `IDLE` or the armed deadline, see `encode`.
    armed: AtomicU64,
    /// Mirror of the clock's interval, read by `flush`.
    interval_ns: AtomicU64,
    shutdown: AtomicBool,
    /// Thread blocked in `wait_for_deadline`.
    timer: OnceLock<Thread>,
    /// Serializes ticks against `halt`.
    retire: Mutex<()>,
    clock: Mutex<FrameClock>,
    vblank: Condvar,
}

impl VblankPacer {
    pub fn new(refresh_hz: u32) -> Self {
        let clock = FrameClock::new(refresh_hz);
        Self {
            epoch: Instant::now(),
            armed: AtomicU64::new(IDLE),
            interval_ns: AtomicU64::new(clock.refresh_interval().as_nanos() as u64),
            shutdown: AtomicBool::new(false),
            timer: OnceLock::new(),
            retire: Mutex::new(()),
            clock: Mutex::new(clock),
            vblank: Condvar::new(),
        }
    }

    fn encode(&self, deadline: Instant) -> u64 {
        (deadline.saturating_duration_since(self.epoch).as_nanos() as u64).max(1)
    }

    fn decode(&self, armed: u64) -> Instant {
        self.epoch + Duration::from_nanos(armed)
    }

    pub fn state(&self) -> PacerState {
        match self.armed.load(Ordering::Acquire) {
            IDLE => PacerState::Idle,
            armed => PacerState::Armed {
                deadline: self.decode(armed),
            },
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire) != IDLE
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns.load(Ordering::Relaxed))
    }

    /// Applies from the next arming on.
    pub fn set_refresh_rate(&self, refresh_hz: u32) {
        let mut clock = self.clock.lock().unwrap();
        clock.set_refresh_rate(refresh_hz);
        self.interval_ns
            .store(clock.refresh_interval().as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn vblank_sequence(&self) -> u64 {
        self.clock.lock().unwrap().sequence()
    }

    /// Idle -> Armed for one interval after `now`. Only one caller wins.
    fn try_arm(&self, now: Instant) -> bool {
        let deadline = self.encode(now + self.refresh_interval());
        let armed = self
            .armed
            .compare_exchange(IDLE, deadline, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if armed {
            if let Some(timer) = self.timer.get() {
                timer.unpark();
            }
        }
        armed
    }

    /// Arm for one refresh interval from now if idle and there is work.
    ///
    /// Lock-free. Returns true if this call armed the pacer.
    pub fn flush(&self, slots: &RelaySlots) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        // Pairs with the fence in `on_tick`.
        atomic::fence(Ordering::SeqCst);
        if self.is_armed() || !slots.has_pending() {
            return false;
        }
        let armed = self.try_arm(Instant::now());
        if armed {
            trace!("pacer: Idle -> Armed");
        }
        armed
    }

    /// Emulated VBlank.
    pub fn on_tick(&self, slots: &RelaySlots) -> Tick {
        tracy_span!("pacer_tick");

        let (tick, displaced) = {
            let _retire = self.retire.lock().unwrap();
            let retired = slots.retire_pending();

            let now = Instant::now();
            let vblank = {
                let mut clock = self.clock.lock().unwrap();
                let vblank = clock.vblank(now);
                self.vblank.notify_all();
                vblank
            };
            tracy_frame_mark!("vblank");

            self.armed.store(IDLE, Ordering::SeqCst);
            atomic::fence(Ordering::SeqCst);
            let rearmed = !self.shutdown.load(Ordering::Acquire)
                && slots.has_pending()
                && self.try_arm(now);
            if rearmed {
                trace!("pacer: re-armed for raced-in commit");
            }

            let (retired, displaced) = match retired {
                Some(r) => (Some((r.id, r.count)), r.displaced),
                None => (None, None),
            };
            let tick = Tick {
                retired,
                vblank,
                rearmed,
            };
            (tick, displaced)
        };

        // Buffers of a frame that was never exported go here, off the lock.
        drop(displaced);
        tick
    }

    /// Disarm without ticking.
    pub fn cancel(&self) {
        if self.armed.swap(IDLE, Ordering::AcqRel) != IDLE {
            trace!("pacer: cancelled");
        }
    }

    /// Disarm and empty both slots, returning the records they held.
    ///
    /// Serialized against ticks, so a tick in progress cannot move a record
    /// into `active` after the slots were cleared. The caller drops the
    /// records once it holds no locks.
    #[must_use = "dropping the records releases their buffers"]
    pub fn halt(&self, slots: &RelaySlots) -> Vec<Box<PresentRecord>> {
        let _retire = self.retire.lock().unwrap();
        let released = slots.clear();
        self.armed.store(IDLE, Ordering::SeqCst);
        released
    }

    /// Stop the timer thread for good.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.armed.store(IDLE, Ordering::SeqCst);
        if let Some(timer) = self.timer.get() {
            timer.unpark();
        }
        let _clock = self.clock.lock().unwrap();
        self.vblank.notify_all();
    }

    /// Block until an armed deadline passes.
    ///
    /// Returns false once the pacer has been shut down. The first thread to
    /// call this becomes the pacer's timer thread: commits unpark it when
    /// they arm the pacer. It then ticks the owning device.
    pub fn wait_for_deadline(&self) -> bool {
        self.timer.get_or_init(thread::current);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            match self.armed.load(Ordering::Acquire) {
                IDLE => thread::park(),
                armed => {
                    let deadline = self.decode(armed);
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// Wait until the VBlank sequence moves past `sequence`.
    ///
    /// Returns the current sequence, which equals `sequence` on timeout.
    pub fn wait_vblank(&self, sequence: u64, timeout: Duration) -> u64 {
        let clock = self.clock.lock().unwrap();
        let (clock, _) = self
            .vblank
            .wait_timeout_while(clock, timeout, |clock| {
                !self.shutdown.load(Ordering::Acquire) && clock.sequence() <= sequence
            })
            .unwrap();
        clock.sequence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Framebuffer;
    use crate::record::PresentRecord;
    use crate::registry::HandleRegistry;
    use crate::testing::TestBuffer;
    use std::sync::Arc;
    use std::thread;

    fn commit(slots: &RelaySlots, registry: &HandleRegistry, id: u32) {
        let h = registry.register(TestBuffer::new_ref());
        let fb = Framebuffer::new(id, registry, &[h]).unwrap();
        slots.commit(PresentRecord::from_framebuffer(&fb));
    }

    #[test]
    fn test_flush_only_arms_with_pending() {
        let pacer = VblankPacer::new(60);
        let slots = RelaySlots::new();
        assert!(!pacer.flush(&slots));
        assert_eq!(pacer.state(), PacerState::Idle);

        commit(&slots, &HandleRegistry::new(), 1);
        assert!(pacer.flush(&slots));
        assert!(pacer.is_armed());
        // Already armed
        assert!(!pacer.flush(&slots));
    }

    #[test]
    fn test_armed_deadline_is_one_interval() {
        let pacer = VblankPacer::new(50);
        let slots = RelaySlots::new();
        commit(&slots, &HandleRegistry::new(), 1);

        let before = Instant::now();
        pacer.flush(&slots);
        let PacerState::Armed { deadline } = pacer.state() else {
            panic!("pacer should be armed");
        };
        assert!(deadline >= before + Duration::from_millis(20));
        assert!(deadline <= Instant::now() + Duration::from_millis(20));
    }

    #[test]
    fn test_tick_retires_and_returns_to_idle() {
        let pacer = VblankPacer::new(60);
        let slots = RelaySlots::new();
        let registry = HandleRegistry::new();
        commit(&slots, &registry, 4);
        pacer.flush(&slots);

        let tick = pacer.on_tick(&slots);
        assert_eq!(tick.retired, Some((4, 1)));
        assert_eq!(tick.vblank.sequence, 1);
        assert!(!tick.rearmed);
        assert_eq!(pacer.state(), PacerState::Idle);
        assert!(slots.has_active());
    }

    #[test]
    fn test_tick_without_pending_still_acknowledges() {
        let pacer = VblankPacer::new(60);
        let slots = RelaySlots::new();
        let tick = pacer.on_tick(&slots);
        assert!(tick.retired.is_none());
        assert_eq!(pacer.vblank_sequence(), 1);
    }

    #[test]
    fn test_cancel_disarms() {
        let pacer = VblankPacer::new(60);
        let slots = RelaySlots::new();
        commit(&slots, &HandleRegistry::new(), 1);
        pacer.flush(&slots);
        pacer.cancel();
        assert_eq!(pacer.state(), PacerState::Idle);
    }

    #[test]
    fn test_halt_clears_slots() {
        let pacer = VblankPacer::new(60);
        let slots = RelaySlots::new();
        let registry = HandleRegistry::new();
        commit(&slots, &registry, 1);
        pacer.on_tick(&slots);
        commit(&slots, &registry, 2);
        pacer.flush(&slots);

        let released = pacer.halt(&slots);
        assert_eq!(released.len(), 2);
        assert!(!slots.has_pending());
        assert!(!slots.has_active());
        assert!(!pacer.is_armed());
    }

    #[test]
    fn test_timer_thread_ticks_and_shuts_down() {
        let pacer = Arc::new(VblankPacer::new(1000));
        let slots = Arc::new(RelaySlots::new());
        let timer = {
            let pacer = pacer.clone();
            let slots = slots.clone();
            thread::spawn(move || {
                let mut ticks = 0;
                while pacer.wait_for_deadline() {
                    pacer.on_tick(&slots);
                    ticks += 1;
                }
                ticks
            })
        };

        // Let the timer park idle first; arming must unpark it
        thread::sleep(Duration::from_millis(20));
        let registry = HandleRegistry::new();
        commit(&slots, &registry, 1);
        assert!(pacer.flush(&slots));
        assert_eq!(pacer.wait_vblank(0, Duration::from_secs(5)), 1);
        assert!(slots.has_active());
        assert_eq!(pacer.state(), PacerState::Idle);

        pacer.shutdown();
        assert_eq!(timer.join().unwrap(), 1);
        assert!(!pacer.flush(&slots));
    }

    #[test]
    fn test_tick_releases_displaced_record() {
        let pacer = VblankPacer::new(60);
        let slots = RelaySlots::new();
        let registry = HandleRegistry::new();
        let buf = TestBuffer::new_ref();
        let h = registry.register(buf.clone());
        let fb = Framebuffer::new(1, &registry, &[h]).unwrap();

        slots.commit(PresentRecord::from_framebuffer(&fb));
        pacer.on_tick(&slots);
        slots.commit(PresentRecord::from_framebuffer(&fb));
        pacer.on_tick(&slots);
        // registry + framebuffer + local + active
        assert_eq!(Arc::strong_count(&buf), 4);
    }

    #[test]
    fn test_wait_vblank_wakes_on_tick() {
        let pacer = Arc::new(VblankPacer::new(60));
        let waiter = {
            let pacer = pacer.clone();
            thread::spawn(move || pacer.wait_vblank(0, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        pacer.on_tick(&RelaySlots::new());
        assert_eq!(waiter.join().unwrap(), 1);

        assert_eq!(pacer.wait_vblank(1, Duration::from_millis(1)), 1);
    }
}
