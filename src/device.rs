//! The relay device.
//!
//! # Design Invariants
//!
//! 1. **Owned service object**: there is no global device. A `RelayDevice` is
//!    constructed explicitly and cloned into every entry point; independent
//!    devices never share state.
//!
//! 2. **Two roles**: producers open a `Client` (handle registry, framebuffers,
//!    commits). Exactly one consumer at a time holds a `ConsumerLink` (event
//!    channel, export, mode configuration).
//!
//! 3. **Non-blocking commit**: a commit is one atomic exchange on `pending`
//!    plus a lock-free check-and-arm of the pacer. It takes no lock and never
//!    waits for the pacer or the consumer.
//!
//! 4. **Teardown clears**: tearing down the `ConsumerLink` (explicitly or by
//!    dropping it) fails outstanding waits and releases `pending` and
//!    `active`. Nothing else clears relay state except a power-off. The
//!    slots are cleared before the registration is given up, so a consumer
//!    attaching afterwards never loses a frame to the old teardown.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::buffer::BufferRef;
use crate::config::{RelayConfig, TimerMode};
use crate::error::{RelayError, Result};
use crate::event::{DisplayMode, EventChannel, ModeObservers, RelayEvent};
use crate::framebuffer::Framebuffer;
use crate::pacer::{PacerState, Tick, VblankPacer};
use crate::power::{PowerSequencer, PowerState};
use crate::record::{PresentRecord, RelaySlots};
use crate::registry::{BufferHandle, HandleRegistry};
use crate::tracy_span;

#[derive(Debug)]
struct DeviceInner {
    slots: RelaySlots,
    pacer: Arc<VblankPacer>,
    power: PowerSequencer,
    mode: Mutex<DisplayMode>,
    observers: ModeObservers,
    consumer: Mutex<Option<Arc<EventChannel>>>,
    export_lock: Mutex<()>,
    next_fb_id: AtomicU32,
    open_clients: AtomicUsize,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.pacer.shutdown();
    }
}

/// Handle to one relay device. Clones share the device.
#[derive(Debug, Clone)]
pub struct RelayDevice {
    inner: Arc<DeviceInner>,
}

impl RelayDevice {
    /// Create a device as described by `config`, starting its VBlank timer
    /// thread unless the config asks for manual ticking.
    pub fn new(config: &RelayConfig) -> io::Result<Self> {
        let device = Self::build(config.mode);
        if config.timer == TimerMode::Thread {
            device.spawn_timer()?;
        }
        info!(
            "relay device up, mode {}x{}@{}",
            config.mode.width, config.mode.height, config.mode.refresh
        );
        Ok(device)
    }

    /// Create a device whose pacer only fires on `tick()`.
    pub fn manual(mode: DisplayMode) -> Self {
        Self::build(mode)
    }

    fn build(mode: DisplayMode) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                slots: RelaySlots::new(),
                pacer: Arc::new(VblankPacer::new(mode.refresh)),
                power: PowerSequencer::new(PowerState::On),
                mode: Mutex::new(mode),
                observers: ModeObservers::default(),
                consumer: Mutex::new(None),
                export_lock: Mutex::new(()),
                next_fb_id: AtomicU32::new(1),
                open_clients: AtomicUsize::new(0),
            }),
        }
    }

    fn spawn_timer(&self) -> io::Result<()> {
        let pacer = self.inner.pacer.clone();
        let device = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("membrane-vblank".into())
            .spawn(move || run_timer(pacer, device))?;
        Ok(())
    }

    /// Open a producer registration.
    pub fn open_client(&self) -> Client {
        self.inner.open_clients.fetch_add(1, Ordering::AcqRel);
        Client {
            device: self.clone(),
            registry: HandleRegistry::new(),
            framebuffers: Mutex::new(HashMap::new()),
        }
    }

    /// Register the consumer. Fails with `Busy` while another one is attached.
    pub fn attach_consumer(&self) -> Result<ConsumerLink> {
        let mut consumer = self.inner.consumer.lock().unwrap();
        if consumer.as_ref().is_some_and(|ch| !ch.is_torn_down()) {
            return Err(RelayError::Busy);
        }
        let channel = Arc::new(EventChannel::new(self.power()));
        *consumer = Some(channel.clone());
        info!("consumer attached");
        Ok(ConsumerLink {
            device: self.clone(),
            channel,
        })
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer_channel().is_some()
    }

    fn consumer_channel(&self) -> Option<Arc<EventChannel>> {
        self.inner.consumer.lock().unwrap().clone()
    }

    fn detach_consumer(&self, channel: &Arc<EventChannel>) {
        let released = {
            let mut consumer = self.inner.consumer.lock().unwrap();
            if consumer.as_ref().is_some_and(|ch| Arc::ptr_eq(ch, channel)) {
                // Clear while still registered: the next consumer cannot
                // attach until this is done.
                let released = self.inner.pacer.halt(&self.inner.slots);
                *consumer = None;
                Some(released)
            } else {
                None
            }
        };
        channel.teardown();
        if let Some(released) = released {
            drop(released);
            info!("consumer detached, relay state released");
        }
    }

    /// Display pipeline endpoint: make `fb` the next frame to scan out.
    pub fn on_commit(&self, fb: &Framebuffer) {
        tracy_span!("commit");

        let record = PresentRecord::from_framebuffer(fb);
        if let Some(superseded) = self.inner.slots.commit(record) {
            trace!(id = fb.id(), superseded, "commit superseded an undelivered frame");
        } else {
            trace!(id = fb.id(), "commit");
        }
        self.inner.pacer.flush(&self.inner.slots);
    }

    /// Run one emulated VBlank.
    ///
    /// Called by the timer thread; call it directly on a manual device.
    pub fn tick(&self) -> Tick {
        let tick = self.inner.pacer.on_tick(&self.inner.slots);
        if let Some((id, count)) = tick.retired {
            trace!(id, count, sequence = tick.vblank.sequence, "vblank retired frame");
            if let Some(channel) = self.consumer_channel() {
                channel.notify_present(count);
            }
        }
        tick
    }

    /// Move to `target` power state and tell the consumer.
    pub fn set_power(&self, target: PowerState) {
        self.inner
            .power
            .enter(target, &self.inner.slots, &self.inner.pacer);
        if let Some(channel) = self.consumer_channel() {
            channel.notify_power(target);
        }
    }

    pub fn power(&self) -> PowerState {
        self.inner.power.current()
    }

    /// Update the display mode. Returns true if it changed.
    pub fn configure(&self, mode: DisplayMode) -> bool {
        {
            let mut current = self.inner.mode.lock().unwrap();
            if *current == mode {
                debug!("configure: mode unchanged");
                return false;
            }
            *current = mode;
        }
        self.inner.pacer.set_refresh_rate(mode.refresh);
        info!("mode changed to {}x{}@{}", mode.width, mode.height, mode.refresh);
        self.inner.observers.broadcast(mode);
        true
    }

    pub fn mode(&self) -> DisplayMode {
        *self.inner.mode.lock().unwrap()
    }

    /// Receive every future mode change.
    pub fn subscribe_mode_changes(&self) -> Receiver<DisplayMode> {
        self.inner.observers.subscribe()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.slots.has_pending()
    }

    pub fn has_active(&self) -> bool {
        self.inner.slots.has_active()
    }

    pub fn pacer_state(&self) -> PacerState {
        self.inner.pacer.state()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.pacer.refresh_interval()
    }

    /// Number of emulated VBlanks so far.
    pub fn vblank_count(&self) -> u64 {
        self.inner.pacer.vblank_sequence()
    }

    /// Wait for the VBlank after `sequence`; returns the sequence reached.
    pub fn wait_vblank(&self, sequence: u64, timeout: Duration) -> u64 {
        self.inner.pacer.wait_vblank(sequence, timeout)
    }

    fn next_framebuffer_id(&self) -> u32 {
        self.inner.next_fb_id.fetch_add(1, Ordering::Relaxed)
    }

    fn client_closed(&self) {
        if self.inner.open_clients.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("last producer closed");
            self.set_power(PowerState::NoConsumer);
        }
    }
}

fn run_timer(pacer: Arc<VblankPacer>, device: Weak<DeviceInner>) {
    debug!("vblank timer started");
    while pacer.wait_for_deadline() {
        let Some(inner) = device.upgrade() else {
            break;
        };
        RelayDevice { inner }.tick();
    }
    debug!("vblank timer stopped");
}

/// A producer registration: its own handle namespace and framebuffers.
#[derive(Debug)]
pub struct Client {
    device: RelayDevice,
    registry: HandleRegistry,
    framebuffers: Mutex<HashMap<u32, Arc<Framebuffer>>>,
}

impl Client {
    pub fn device(&self) -> &RelayDevice {
        &self.device
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn register_buffer(&self, buffer: BufferRef) -> BufferHandle {
        self.registry.register(buffer)
    }

    /// Register a buffer received as a file descriptor.
    pub fn register_external_buffer(&self, fd: OwnedFd) -> BufferHandle {
        self.registry.register_fd(fd)
    }

    pub fn release_handle(&self, handle: BufferHandle) -> Result<()> {
        self.registry.release(handle)
    }

    /// Build a framebuffer the caller owns.
    pub fn create_framebuffer(&self, handles: &[BufferHandle]) -> Result<Framebuffer> {
        let fb = Framebuffer::new(self.device.next_framebuffer_id(), &self.registry, handles)?;
        debug!(id = fb.id(), planes = fb.plane_count(), "framebuffer created");
        Ok(fb)
    }

    /// Build a framebuffer owned by this client and return its id.
    pub fn add_framebuffer(&self, handles: &[BufferHandle]) -> Result<u32> {
        let fb = self.create_framebuffer(handles)?;
        let id = fb.id();
        self.framebuffers.lock().unwrap().insert(id, Arc::new(fb));
        Ok(id)
    }

    pub fn remove_framebuffer(&self, id: u32) -> Result<()> {
        self.framebuffers
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(RelayError::NotFound)
    }

    fn framebuffer(&self, id: u32) -> Result<Arc<Framebuffer>> {
        self.framebuffers
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RelayError::NotFound)
    }

    pub fn commit(&self, fb: &Framebuffer) {
        self.device.on_commit(fb);
    }

    /// Commit one of this client's framebuffers by id.
    pub fn page_flip(&self, id: u32) -> Result<()> {
        let fb = self.framebuffer(id)?;
        self.device.on_commit(&fb);
        Ok(())
    }

    /// Modeset: a framebuffer powers the display on and shows it, `None`
    /// powers it off.
    pub fn set_crtc(&self, fb: Option<&Framebuffer>) {
        match fb {
            Some(fb) => {
                self.device.set_power(PowerState::On);
                self.device.on_commit(fb);
            }
            None => self.device.set_power(PowerState::Off),
        }
    }

    /// `set_crtc` for one of this client's framebuffers by id.
    pub fn set_crtc_id(&self, id: Option<u32>) -> Result<()> {
        match id {
            Some(id) => {
                let fb = self.framebuffer(id)?;
                self.set_crtc(Some(&*fb));
            }
            None => self.set_crtc(None),
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.framebuffers.lock().unwrap().clear();
        self.device.client_closed();
    }
}

/// Buffers handed out by one export.
///
/// `handles[i]` is `None` when minting that position failed; the other
/// positions are still valid.
#[derive(Debug, Default)]
pub struct Export {
    pub id: u32,
    pub handles: Vec<Option<OwnedFd>>,
}

impl Export {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.handles.iter().all(Option::is_some)
    }
}

/// The consumer's registration. Dropping it tears the registration down.
#[derive(Debug)]
pub struct ConsumerLink {
    device: RelayDevice,
    channel: Arc<EventChannel>,
}

impl ConsumerLink {
    pub fn device(&self) -> &RelayDevice {
        &self.device
    }

    /// Block until the next coalesced notification.
    pub fn wait(&self) -> Result<RelayEvent> {
        self.channel.signal_wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<RelayEvent>> {
        self.channel.signal_wait_timeout(timeout)
    }

    /// Take the active record and mint one handle per buffer.
    pub fn export(&self) -> Export {
        tracy_span!("export");

        let inner = &self.device.inner;
        let _guard = inner.export_lock.lock().unwrap();
        let Some(record) = inner.slots.take_active() else {
            return Export::empty();
        };

        let handles = record
            .buffers()
            .iter()
            .enumerate()
            .map(|(position, buffer)| match buffer.mint_handle() {
                Ok(fd) => Some(fd),
                Err(err) => {
                    warn!(id = record.id(), position, "failed to mint export handle: {err}");
                    None
                }
            })
            .collect();

        trace!(id = record.id(), count = record.count(), "exported");
        Export {
            id: record.id(),
            handles,
        }
    }

    /// Negotiate the display mode. Returns true if it changed.
    pub fn configure(&self, mode: DisplayMode) -> bool {
        self.device.configure(mode)
    }

    pub fn power(&self) -> PowerState {
        self.device.power()
    }

    /// End the registration: fail every current and future wait with
    /// `Disconnected` and release `pending` and `active`. Idempotent.
    pub fn teardown(&self) {
        self.device.detach_consumer(&self.channel);
    }
}

impl Drop for ConsumerLink {
    fn drop(&mut self) {
        self.teardown();
    }
}
