//! Consumer daemon tests
//!
//! The daemon runs against an in-process `ConsumerLink` and fake
//! collaborators, so every allocator and compositor call can be checked.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use membrane::daemon::hal::{DisplayConfig, PowerMode};
use membrane::daemon::{Daemon, PresentOutcome, RelaySource};
use membrane::protocol::peer_closed;
use membrane::testing::{FakeAllocator, FakeBacklight, FakeCompositor, RelayFixture};
use membrane::{
    ConsumerLink, DaemonConfig, DisplayMode, Export, PowerState, RelayError, RelayEvent,
};

const STRIDE: u32 = 768;

type TestDaemon = Daemon<ConsumerLink, FakeAllocator, FakeCompositor, FakeBacklight>;

struct Harness {
    fixture: RelayFixture,
    daemon: TestDaemon,
    allocator: FakeAllocator,
    compositor: FakeCompositor,
    backlight: FakeBacklight,
}

impl Harness {
    fn new() -> Self {
        Self::with_display(DisplayConfig {
            width: 720,
            height: 1600,
            vsync_period_ns: 16_666_666,
        })
    }

    fn with_display(display: DisplayConfig) -> Self {
        let fixture = RelayFixture::new();
        let allocator = FakeAllocator::new(STRIDE);
        let compositor = FakeCompositor::new(display);
        let backlight = FakeBacklight::new(120);

        let daemon = Daemon::start(
            fixture.attach_consumer(),
            allocator.clone(),
            compositor.clone(),
            Some(backlight.clone()),
            &DaemonConfig::default(),
        )
        .expect("Failed to start daemon");

        Self {
            fixture,
            daemon,
            allocator,
            compositor,
            backlight,
        }
    }
}

/// Startup probes the stride, powers on and negotiates the mode
#[test]
fn test_startup() {
    let h = Harness::with_display(DisplayConfig {
        width: 720,
        height: 1600,
        vsync_period_ns: 11_111_111,
    });

    assert_eq!(h.allocator.allocations(), 1);
    assert_eq!(h.allocator.releases(), vec![1]);
    assert_eq!(h.allocator.live(), 0);
    assert_eq!(h.daemon.desc().stride, STRIDE);
    assert_eq!(h.compositor.calls().power_modes, vec![PowerMode::On]);
    assert_eq!(
        h.fixture.device().mode(),
        DisplayMode {
            width: 720,
            height: 1600,
            refresh: 90,
        }
    );
}

/// Relay source that swaps every exported plane handle for one end of a
/// socketpair and keeps the other end, so the test can see when the daemon
/// closes a handle.
struct TrackedPlanes {
    link: ConsumerLink,
    peers: Vec<UnixStream>,
}

impl RelaySource for TrackedPlanes {
    fn configure(&mut self, mode: DisplayMode) -> membrane::Result<bool> {
        Ok(self.link.configure(mode))
    }

    fn wait(&mut self) -> membrane::Result<RelayEvent> {
        self.link.wait()
    }

    fn export(&mut self) -> membrane::Result<Export> {
        let mut export = self.link.export();
        // The last handle is the metadata blob and must stay readable
        let planes = export.count().saturating_sub(1);
        for handle in export.handles.iter_mut().take(planes) {
            let (ours, theirs) = UnixStream::pair()?;
            *handle = Some(OwnedFd::from(theirs));
            self.peers.push(ours);
        }
        Ok(export)
    }
}

/// A cache hit closes the duplicate handles that came with the export
#[test]
fn test_cache_hit_closes_duplicate_handles() {
    let fixture = RelayFixture::new();
    let relay = TrackedPlanes {
        link: fixture.attach_consumer(),
        peers: Vec::new(),
    };
    let allocator = FakeAllocator::new(STRIDE);
    let compositor = FakeCompositor::new(DisplayConfig {
        width: 720,
        height: 1600,
        vsync_period_ns: 16_666_666,
    });
    let mut daemon = Daemon::start(
        relay,
        allocator.clone(),
        compositor,
        None::<FakeBacklight>,
        &DaemonConfig::default(),
    )
    .expect("Failed to start daemon");

    let (fb, _) = fixture.importable_framebuffer();
    fixture.commit_and_tick(&fb);
    daemon.dispatch().unwrap();
    fixture.commit_and_tick(&fb);
    daemon.dispatch().unwrap();
    assert_eq!(daemon.stats().cache_hits, 1);

    let peers = &daemon.relay().peers;
    assert_eq!(peers.len(), 2);
    assert!(!peer_closed(&peers[0]), "imported plane must stay open");
    assert!(peer_closed(&peers[1]), "duplicate plane must be closed");

    drop(daemon);
    assert_eq!(allocator.live(), 0);
}

/// The same buffer twice: one bind, two presents, validation skipped once clean
#[test]
fn test_same_buffer_binds_once() {
    let mut h = Harness::new();
    let (fb, plane) = h.fixture.importable_framebuffer();

    h.fixture.commit_and_tick(&fb);
    h.daemon.dispatch().unwrap();
    h.fixture.commit_and_tick(&fb);
    h.daemon.dispatch().unwrap();

    let calls = h.compositor.calls();
    assert_eq!(calls.binds.len(), 1);
    assert_eq!(calls.presents.len(), 2);
    assert_eq!(calls.validates, 1);

    let imports = h.allocator.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].planes, vec![plane.identity()]);
    assert_eq!(imports[0].metadata, b"native-handle");
    assert_eq!(imports[0].desc.stride, STRIDE);
    assert_eq!(imports[0].desc.width, 720);

    let stats = h.daemon.stats();
    assert_eq!(stats.imports, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.presented, 2);
}

/// Alternating buffers rebind every time
#[test]
fn test_alternating_buffers_rebind() {
    let mut h = Harness::new();
    let (a, _) = h.fixture.importable_framebuffer();
    let (b, _) = h.fixture.importable_framebuffer();

    for fb in [&a, &b, &a, &b] {
        h.fixture.commit_and_tick(fb);
        h.daemon.dispatch().unwrap();
    }

    let calls = h.compositor.calls();
    assert_eq!(calls.binds.len(), 4);
    assert_eq!(calls.presents.len(), 4);
    assert_eq!(h.allocator.imports().len(), 2);
    assert_eq!(h.daemon.cached_buffers(), 2);
}

/// Validation repeats while the compositor keeps requesting changes
#[test]
fn test_validate_until_clean() {
    let mut h = Harness::new();
    let (fb, _) = h.fixture.importable_framebuffer();
    h.compositor.push_validate_changes(true);

    for _ in 0..3 {
        h.fixture.commit_and_tick(&fb);
        h.daemon.dispatch().unwrap();
    }

    let calls = h.compositor.calls();
    assert_eq!(calls.validates, 2);
    assert_eq!(calls.accepts, 1);
    assert_eq!(calls.presents.len(), 3);
}

/// Frames that cannot be imported are dropped without presenting
#[test]
fn test_import_failures_drop_frames() {
    let mut h = Harness::new();

    // A single handle has no metadata
    let (single, _) = h.fixture.framebuffer(1);
    h.fixture.commit_and_tick(&single);
    h.daemon.dispatch().unwrap();

    // Empty metadata blob
    let (empty, _) = h.fixture.importable_framebuffer_with(b"");
    h.fixture.commit_and_tick(&empty);
    h.daemon.dispatch().unwrap();

    // Allocator refuses
    h.allocator.set_fail_imports(true);
    let (refused, _) = h.fixture.importable_framebuffer();
    h.fixture.commit_and_tick(&refused);
    assert_eq!(
        h.daemon.present_active().unwrap(),
        PresentOutcome::Dropped { id: refused.id() }
    );

    assert_eq!(h.daemon.stats().dropped, 3);
    assert!(h.compositor.calls().presents.is_empty());
    assert!(!h.daemon.has_presented());
    assert_eq!(h.daemon.cached_buffers(), 0);
}

/// Nothing active is a no-op
#[test]
fn test_empty_export() {
    let mut h = Harness::new();
    assert_eq!(h.daemon.present_active().unwrap(), PresentOutcome::Empty);
    assert!(h.compositor.calls().binds.is_empty());
}

/// A failed present keeps the previous frame on screen
#[test]
fn test_present_failure() {
    let mut h = Harness::new();
    let (a, _) = h.fixture.importable_framebuffer();
    let (b, _) = h.fixture.importable_framebuffer();

    h.fixture.commit_and_tick(&a);
    h.daemon.dispatch().unwrap();

    h.compositor.set_fail_presents(true);
    h.fixture.commit_and_tick(&b);
    h.daemon.dispatch().unwrap();

    assert_eq!(h.daemon.stats().presented, 1);
    assert_eq!(h.daemon.stats().dropped, 1);
    assert!(h.daemon.has_presented());
    // Both imports stay cached, nothing released yet
    assert_eq!(h.allocator.live(), 2);
}

/// Colliding ids evict the older import, released once off screen
#[test]
fn test_cache_collision() {
    let mut h = Harness::new();
    let (first, _) = h.fixture.importable_framebuffer();
    // Burn ids so the next framebuffer lands in the same slot
    let burned: Vec<_> = (0..15).map(|_| h.fixture.framebuffer(1).0).collect();
    let (second, _) = h.fixture.importable_framebuffer();
    assert_eq!(second.id() - first.id(), 16);
    drop(burned);

    h.fixture.commit_and_tick(&first);
    h.daemon.dispatch().unwrap();
    let first_serial = h.allocator.imports()[0].serial;

    h.fixture.commit_and_tick(&second);
    h.daemon.dispatch().unwrap();

    assert_eq!(h.daemon.cached_buffers(), 1);
    assert_eq!(h.allocator.imports().len(), 2);
    assert!(h.allocator.releases().contains(&first_serial));

    // Coming back to the first id means importing again
    h.fixture.commit_and_tick(&first);
    h.daemon.dispatch().unwrap();
    assert_eq!(h.allocator.imports().len(), 3);
}

/// Off dims the backlight once, On restores it and forces a rebind
#[test]
fn test_power_cycle() {
    let mut h = Harness::new();
    let (fb, _) = h.fixture.importable_framebuffer();
    h.fixture.commit_and_tick(&fb);
    h.daemon.dispatch().unwrap();

    h.fixture.device().set_power(PowerState::Off);
    h.daemon.dispatch().unwrap();
    assert_eq!(h.backlight.level(), 0);
    assert!(h.daemon.policy().is_dimmed());

    h.fixture.device().set_power(PowerState::On);
    h.daemon.dispatch().unwrap();
    assert_eq!(h.backlight.level(), 120);
    assert_eq!(
        h.compositor.calls().power_modes,
        vec![PowerMode::On, PowerMode::Off, PowerMode::On]
    );

    // Same buffer again, but the power transition forces bind and validate
    h.fixture.commit_and_tick(&fb);
    h.daemon.dispatch().unwrap();
    let calls = h.compositor.calls();
    assert_eq!(calls.binds.len(), 2);
    assert_eq!(calls.validates, 2);
    assert_eq!(calls.presents.len(), 2);
}

/// NoConsumer invalidates the cache without touching power or backlight
#[test]
fn test_no_consumer_invalidates_cache() {
    let mut h = Harness::new();
    let (fb, _) = h.fixture.importable_framebuffer();
    h.fixture.commit_and_tick(&fb);
    h.daemon.dispatch().unwrap();
    assert_eq!(h.daemon.cached_buffers(), 1);

    h.fixture.device().set_power(PowerState::NoConsumer);
    h.daemon.dispatch().unwrap();
    assert_eq!(h.daemon.cached_buffers(), 0);
    assert_eq!(h.compositor.calls().power_modes, vec![PowerMode::On]);
    assert_eq!(h.backlight.set_calls(), 0);

    h.fixture.commit_and_tick(&fb);
    h.daemon.dispatch().unwrap();
    assert_eq!(h.allocator.imports().len(), 2);
}

/// Teardown ends the run loop cleanly and everything is released
#[test]
fn test_run_ends_on_disconnect() {
    let mut h = Harness::new();
    let (fb, _) = h.fixture.importable_framebuffer();
    h.fixture.commit_and_tick(&fb);
    h.daemon.dispatch().unwrap();

    h.daemon.relay().teardown();
    h.daemon.run().expect("run should end cleanly");
    assert!(matches!(
        h.daemon.dispatch(),
        Err(RelayError::Disconnected)
    ));

    drop(h.daemon);
    assert_eq!(h.allocator.live(), 0);
}
