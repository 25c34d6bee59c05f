//! Consumer daemon: imports relayed buffers and presents them.
//!
//! Per notification the daemon walks
//!
//! ```text
//! FetchActive -> CacheHit | Import -> Bind -> ValidateMaybe -> Present -> Retire
//! ```
//!
//! strictly sequentially. Nothing is retried: a frame that fails anywhere
//! along the way is dropped and the next notification brings a newer one.
//!
//! Buffers are shared between the cache and the on-screen slot as `Rc`s and
//! handed back to the allocator once the last holder lets go.

pub mod cache;
pub mod hal;
pub mod policy;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::rc::{Rc, Weak};

use anyhow::{bail, Context};
use tracing::{debug, info, trace, warn};

use crate::config::DaemonConfig;
use crate::device::{ConsumerLink, Export};
use crate::error::{RelayError, Result};
use crate::event::{DisplayMode, RelayEvent};
use crate::ipc::RelayClient;
use crate::power::PowerState;
use crate::{tracy_plot, tracy_span};

use cache::BufferCache;
use hal::{Allocator, Backlight, BufferDesc, Compositor, PowerMode, SysfsBacklight};
use policy::{PowerAction, PowerPolicy};

/// Where the daemon gets its notifications and buffers from.
pub trait RelaySource {
    /// Negotiate the display mode. Returns true if it changed.
    fn configure(&mut self, mode: DisplayMode) -> Result<bool>;

    /// Block for the next coalesced notification.
    fn wait(&mut self) -> Result<RelayEvent>;

    fn export(&mut self) -> Result<Export>;
}

impl RelaySource for ConsumerLink {
    fn configure(&mut self, mode: DisplayMode) -> Result<bool> {
        Ok(ConsumerLink::configure(self, mode))
    }

    fn wait(&mut self) -> Result<RelayEvent> {
        ConsumerLink::wait(self)
    }

    fn export(&mut self) -> Result<Export> {
        Ok(ConsumerLink::export(self))
    }
}

impl RelaySource for RelayClient {
    fn configure(&mut self, mode: DisplayMode) -> Result<bool> {
        RelayClient::configure(self, mode)
    }

    fn wait(&mut self) -> Result<RelayEvent> {
        RelayClient::wait(self)
    }

    fn export(&mut self) -> Result<Export> {
        RelayClient::export(self)
    }
}

/// What happened to one present notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Nothing was active.
    Empty,
    Presented { id: u32, cache_hit: bool },
    Dropped { id: u32 },
}

/// Counters for everything the daemon did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStats {
    pub presented: u64,
    pub dropped: u64,
    pub imports: u64,
    pub cache_hits: u64,
    pub binds: u64,
    pub validates: u64,
}

pub struct Daemon<R, A: Allocator, C, L> {
    relay: R,
    allocator: A,
    compositor: C,
    policy: PowerPolicy<L>,
    desc: BufferDesc,
    cache: BufferCache<A::Buffer>,
    last_bound: Option<Weak<A::Buffer>>,
    last_presented: Option<Rc<A::Buffer>>,
    /// The previous validate asked for changes, or nothing was validated yet.
    needs_validate: bool,
    /// A power transition happened since the last present.
    revalidate: bool,
    stats: DaemonStats,
}

impl<R, A, C, L> Daemon<R, A, C, L>
where
    R: RelaySource,
    A: Allocator,
    C: Compositor<A::Buffer>,
    L: Backlight,
{
    /// Probe the allocator, power the display on and tell the relay our mode.
    pub fn start(
        mut relay: R,
        mut allocator: A,
        mut compositor: C,
        backlight: Option<L>,
        config: &DaemonConfig,
    ) -> anyhow::Result<Self> {
        let active = compositor
            .active_config()
            .context("error querying active display config")?;
        info!(
            "display {}x{}, vsync period {}ns",
            active.width, active.height, active.vsync_period_ns
        );

        let mut desc = BufferDesc::scanout(active.width, active.height);
        let (probe, stride) = allocator
            .allocate(&desc)
            .context("error probing allocator stride")?;
        allocator.release(probe);
        if stride == 0 {
            bail!("allocator reported a zero stride");
        }
        desc.stride = stride;
        info!("using stride {stride} (width {})", desc.width);

        compositor
            .set_power_mode(PowerMode::On)
            .context("error powering display on")?;

        let mode = DisplayMode {
            width: active.width,
            height: active.height,
            refresh: active.refresh_hz(),
        };
        relay
            .configure(mode)
            .context("error sending display mode to relay")?;
        info!("sent mode {}x{}@{}", mode.width, mode.height, mode.refresh);

        Ok(Self {
            relay,
            allocator,
            compositor,
            policy: PowerPolicy::new(backlight, config.default_backlight_level),
            desc,
            cache: BufferCache::new(config.cache_slots),
            last_bound: None,
            last_presented: None,
            needs_validate: true,
            revalidate: false,
            stats: DaemonStats::default(),
        })
    }

    /// Process notifications until the relay goes away.
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.dispatch() {
                Ok(()) => {}
                Err(RelayError::Disconnected) => break,
                Err(err) => return Err(err).context("error processing relay events"),
            }
        }
        info!("relay disconnected, daemon stopping");
        Ok(())
    }

    /// Wait for one notification and handle it.
    pub fn dispatch(&mut self) -> Result<()> {
        let event = self.relay.wait()?;
        self.handle_event(event)
    }

    /// Dispatch one coalesced notification.
    pub fn handle_event(&mut self, event: RelayEvent) -> Result<()> {
        trace!(flags = ?event.flags, power = ?event.power, "relay event");
        if event.power_changed() {
            self.handle_power(event.power);
        }
        if event.present_ready() {
            self.present_active()?;
        }
        Ok(())
    }

    fn handle_power(&mut self, power: PowerState) {
        debug!(?power, "power notification");
        self.revalidate = true;
        match self.policy.transition(power) {
            PowerAction::None => {}
            PowerAction::DisplayOff => self.set_power_mode(PowerMode::Off),
            PowerAction::DisplayOn => self.set_power_mode(PowerMode::On),
            PowerAction::InvalidateCache => {
                let cached = self.cache.clear();
                debug!("producer gone, dropping {} cached buffers", cached.len());
                for buffer in cached {
                    self.release(buffer);
                }
                self.last_bound = None;
            }
        }
    }

    fn set_power_mode(&mut self, mode: PowerMode) {
        if let Err(err) = self.compositor.set_power_mode(mode) {
            warn!("error setting power mode {mode:?}: {err:?}");
        }
    }

    /// Fetch the active record and put it on screen.
    pub fn present_active(&mut self) -> Result<PresentOutcome> {
        tracy_span!("daemon_present");

        let export = self.relay.export()?;
        if export.is_empty() {
            trace!("nothing active");
            return Ok(PresentOutcome::Empty);
        }
        let id = export.id;

        let (buffer, cache_hit) = match self.cache.lookup(id) {
            Some(buffer) => {
                // Already imported; the fresh handles are duplicates.
                drop(export);
                self.stats.cache_hits += 1;
                (buffer, true)
            }
            None => match self.import(export) {
                Ok(buffer) => {
                    let buffer = Rc::new(buffer);
                    if let Some(evicted) = self.cache.insert(id, buffer.clone()) {
                        self.release(evicted);
                    }
                    self.stats.imports += 1;
                    tracy_plot!("daemon_cached_buffers", self.cache.len());
                    (buffer, false)
                }
                Err(err) => {
                    warn!(id, "dropping frame, import failed: {err:?}");
                    self.stats.dropped += 1;
                    return Ok(PresentOutcome::Dropped { id });
                }
            },
        };

        if let Err(err) = self.present(&buffer) {
            warn!(id, "dropping frame, present failed: {err:?}");
            self.stats.dropped += 1;
            self.release(buffer);
            return Ok(PresentOutcome::Dropped { id });
        }

        if let Some(previous) = self.last_presented.replace(buffer) {
            self.release(previous);
        }
        self.stats.presented += 1;
        trace!(id, cache_hit, "presented");
        Ok(PresentOutcome::Presented { id, cache_hit })
    }

    fn import(&mut self, export: Export) -> anyhow::Result<A::Buffer> {
        let count = export.count();
        if count < 2 {
            bail!("{count} handles, need planes plus metadata");
        }
        let mut handles = export
            .handles
            .into_iter()
            .enumerate()
            .map(|(position, fd)| fd.with_context(|| format!("handle {position} missing")))
            .collect::<anyhow::Result<Vec<OwnedFd>>>()?;

        let metadata = read_metadata(handles.pop().context("no metadata handle")?)?;
        if metadata.is_empty() {
            bail!("empty metadata blob");
        }
        self.allocator.import(handles, &metadata, &self.desc)
    }

    fn present(&mut self, buffer: &Rc<A::Buffer>) -> anyhow::Result<()> {
        let bound = self
            .last_bound
            .as_ref()
            .is_some_and(|last| last.ptr_eq(&Rc::downgrade(buffer)));
        if !bound || self.revalidate {
            self.compositor
                .set_layer_buffer(buffer, None)
                .context("error binding layer buffer")?;
            self.last_bound = Some(Rc::downgrade(buffer));
            self.stats.binds += 1;
        }

        if self.needs_validate || self.revalidate {
            let changes = self.compositor.validate().context("error validating")?;
            if changes {
                self.compositor
                    .accept_changes()
                    .context("error accepting changes")?;
            }
            self.needs_validate = changes;
            self.revalidate = false;
            self.stats.validates += 1;
        }

        // Release fence closes on drop.
        let _fence = self.compositor.present().context("error presenting")?;
        Ok(())
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn compositor(&self) -> &C {
        &self.compositor
    }

    pub fn policy(&self) -> &PowerPolicy<L> {
        &self.policy
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn stats(&self) -> DaemonStats {
        self.stats
    }

    pub fn cached_buffers(&self) -> usize {
        self.cache.len()
    }

    pub fn has_presented(&self) -> bool {
        self.last_presented.is_some()
    }
}

impl<A, C> Daemon<RelayClient, A, C, SysfsBacklight>
where
    A: Allocator,
    C: Compositor<A::Buffer>,
{
    /// Connect to the relay socket at `socket` and start, driving the sysfs
    /// backlight `config` selects.
    pub fn connect(
        socket: &Path,
        allocator: A,
        compositor: C,
        config: &DaemonConfig,
    ) -> anyhow::Result<Self> {
        let relay = RelayClient::connect(socket)
            .with_context(|| format!("error connecting to relay at {}", socket.display()))?;
        Self::start(relay, allocator, compositor, open_backlight(config), config)
    }
}

impl<R, A: Allocator, C, L> Daemon<R, A, C, L> {
    fn release(&mut self, buffer: Rc<A::Buffer>) {
        if let Ok(buffer) = Rc::try_unwrap(buffer) {
            self.allocator.release(buffer);
        }
    }

    /// Hand every buffer back to the allocator.
    pub fn shutdown(&mut self) {
        for buffer in self.cache.clear() {
            self.release(buffer);
        }
        self.last_bound = None;
        if let Some(buffer) = self.last_presented.take() {
            self.release(buffer);
        }
    }
}

impl<R, A: Allocator, C, L> Drop for Daemon<R, A, C, L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The backlight `config` asks for, if it is enabled and present.
pub fn open_backlight(config: &DaemonConfig) -> Option<SysfsBacklight> {
    if !config.backlight {
        return None;
    }
    match SysfsBacklight::open(config.backlight_name.as_deref()) {
        Ok(backlight) => Some(backlight),
        Err(err) => {
            warn!("backlight unavailable: {err:?}");
            None
        }
    }
}

/// Read a metadata handle from offset 0 to the end.
fn read_metadata(fd: OwnedFd) -> anyhow::Result<Vec<u8>> {
    let mut file = File::from(fd);
    file.seek(SeekFrom::Start(0))
        .context("error seeking metadata handle")?;
    let mut blob = Vec::new();
    file.read_to_end(&mut blob)
        .context("error reading metadata handle")?;
    Ok(blob)
}
