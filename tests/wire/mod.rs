//! Wire protocol tests
//!
//! Each test serves a relay device over socketpairs, one session thread per
//! connection, and talks to it through `RelayClient`.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use membrane::buffer::{fd_identity, metadata_memfd};
use membrane::daemon::hal::DisplayConfig;
use membrane::daemon::Daemon;
use membrane::ipc::serve_connection;
use membrane::protocol::{send_frame, Request};
use membrane::testing::{FakeAllocator, FakeBacklight, FakeCompositor};
use membrane::{
    DaemonConfig, DisplayMode, PowerState, RelayClient, RelayDevice, RelayError, RelayServer,
};

fn connect(device: &RelayDevice) -> (RelayClient, JoinHandle<()>) {
    let (ours, theirs) = UnixStream::pair().expect("socketpair");
    let device = device.clone();
    let session = thread::spawn(move || serve_connection(device, theirs));
    (RelayClient::from_stream(ours), session)
}

/// A producer and a consumer daemon talking to the same device
#[test]
fn test_producer_to_daemon() {
    let device = RelayDevice::manual(DisplayMode::default());
    let (mut producer, producer_session) = connect(&device);
    let (consumer, consumer_session) = connect(&device);

    let allocator = FakeAllocator::new(1088);
    let compositor = FakeCompositor::new(DisplayConfig {
        width: 1080,
        height: 2400,
        vsync_period_ns: 8_333_333,
    });
    let mut daemon = Daemon::start(
        consumer,
        allocator.clone(),
        compositor.clone(),
        None::<FakeBacklight>,
        &DaemonConfig::default(),
    )
    .expect("Failed to start daemon");
    assert_eq!(device.mode().refresh, 120);

    let plane = metadata_memfd(b"pixels").unwrap();
    let meta = metadata_memfd(b"native-handle").unwrap();
    let plane_handle = producer.register_external_buffer(plane.as_fd()).unwrap();
    let meta_handle = producer.register_external_buffer(meta.as_fd()).unwrap();
    assert_ne!(plane_handle, meta_handle);

    let fb = producer
        .add_framebuffer(&[plane_handle, meta_handle])
        .unwrap();
    // The framebuffer keeps its buffers after the handles go
    producer.release_handle(plane_handle).unwrap();
    producer.release_handle(meta_handle).unwrap();

    producer.page_flip(fb).unwrap();
    assert!(device.has_pending());
    device.tick();
    daemon.dispatch().unwrap();

    let imports = allocator.imports();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].planes, vec![fd_identity(&plane).unwrap()]);
    assert_eq!(imports[0].metadata, b"native-handle");
    assert_eq!(compositor.calls().presents.len(), 1);

    // Producer hangs up: the daemon sees NoConsumer and drops its cache
    drop(producer);
    producer_session.join().unwrap();
    assert_eq!(device.power(), PowerState::NoConsumer);
    daemon.dispatch().unwrap();
    assert_eq!(daemon.cached_buffers(), 0);

    drop(daemon);
    consumer_session.join().unwrap();
    assert!(!device.has_consumer());
    assert_eq!(allocator.live(), 0);
}

/// Errors come back as typed relay errors
#[test]
fn test_error_replies() {
    let device = RelayDevice::manual(DisplayMode::default());
    let (mut client, _session) = connect(&device);

    assert!(matches!(client.page_flip(42), Err(RelayError::NotFound)));
    assert!(matches!(
        client.add_framebuffer(&[]),
        Err(RelayError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.configure(DisplayMode {
            width: 0,
            height: 1080,
            refresh: 60,
        }),
        Err(RelayError::InvalidArgument(_))
    ));

    // The session survives errors
    assert!(!client
        .configure(DisplayMode::default())
        .expect("configure"));
}

/// Only one consumer session at a time
#[test]
fn test_second_consumer_busy() {
    let device = RelayDevice::manual(DisplayMode::default());
    let (mut first, _first_session) = connect(&device);
    let (mut second, _second_session) = connect(&device);

    let mode = DisplayMode {
        width: 800,
        height: 600,
        refresh: 75,
    };
    assert!(first.configure(mode).unwrap());
    assert!(matches!(second.configure(mode), Err(RelayError::Busy)));
    assert!(matches!(second.export(), Err(RelayError::Busy)));
}

/// Modeset over the wire drives power and notifies the consumer
#[test]
fn test_set_crtc_and_events() {
    let device = RelayDevice::manual(DisplayMode::default());
    let (mut producer, _producer_session) = connect(&device);
    let (mut consumer, _consumer_session) = connect(&device);
    consumer.configure(DisplayMode::default()).unwrap();

    let plane = metadata_memfd(b"pixels").unwrap();
    let handle = producer.register_external_buffer(plane.as_fd()).unwrap();
    let fb = producer.add_framebuffer(&[handle]).unwrap();

    producer.set_crtc(None).unwrap();
    assert_eq!(device.power(), PowerState::Off);
    let event = consumer.wait().unwrap();
    assert!(event.power_changed());
    assert_eq!(event.power, PowerState::Off);

    producer.set_crtc(Some(fb)).unwrap();
    device.tick();
    let event = consumer.wait().unwrap();
    assert!(event.power_changed());
    assert!(event.present_ready());
    assert_eq!(event.power, PowerState::On);

    let export = consumer.export().unwrap();
    assert_eq!(export.id, fb);
    assert_eq!(export.count(), 1);
    let fd = export.handles[0].as_ref().unwrap();
    assert_eq!(fd_identity(fd).unwrap(), fd_identity(&plane).unwrap());

    // Removed framebuffers can no longer be flipped
    producer.remove_framebuffer(fb).unwrap();
    assert!(matches!(producer.page_flip(fb), Err(RelayError::NotFound)));

    // Nothing active now
    assert!(consumer.export().unwrap().is_empty());
}

/// A consumer hanging up mid-wait ends its session and releases the device
#[test]
fn test_hangup_during_wait() {
    let device = RelayDevice::manual(DisplayMode::default());
    let (ours, theirs) = UnixStream::pair().unwrap();
    let session = {
        let device = device.clone();
        thread::spawn(move || serve_connection(device, theirs))
    };

    send_frame(&ours, &Request::Wait, &[]).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(device.has_consumer());

    drop(ours);
    session.join().unwrap();
    assert!(!device.has_consumer());
    assert!(device.attach_consumer().is_ok());
}

/// The listening socket accepts clients at its path
#[test]
fn test_server_socket() {
    let path = std::env::temp_dir().join(format!("membrane-test-{}.sock", std::process::id()));
    let device = RelayDevice::manual(DisplayMode::default());
    let server = RelayServer::bind(&path).unwrap();
    assert_eq!(server.path(), path.as_path());

    {
        let device = device.clone();
        thread::spawn(move || server.run(&device));
    }

    let mut client = RelayClient::connect(&path).unwrap();
    let mode = DisplayMode {
        width: 640,
        height: 480,
        refresh: 60,
    };
    assert!(client.configure(mode).unwrap());
    assert_eq!(device.mode(), mode);

    let _ = std::fs::remove_file(&path);
}

/// Producers get a frame acknowledgement at the next VBlank
#[test]
fn test_wait_vblank_acknowledges_flip() {
    let device = RelayDevice::manual(DisplayMode::default());
    let (mut producer, _session) = connect(&device);

    let plane = metadata_memfd(b"pixels").unwrap();
    let handle = producer.register_external_buffer(plane.as_fd()).unwrap();
    let fb = producer.add_framebuffer(&[handle]).unwrap();
    producer.page_flip(fb).unwrap();

    let ticker = {
        let device = device.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.tick();
        })
    };
    assert_eq!(producer.wait_vblank(Some(0)).unwrap(), 1);
    ticker.join().unwrap();
    assert!(device.has_active());

    // Already past: answered without waiting
    assert_eq!(producer.wait_vblank(Some(0)).unwrap(), 1);
}

/// A daemon started by socket path, with the backlight turned off
#[test]
fn test_daemon_connects_by_path() {
    let path =
        std::env::temp_dir().join(format!("membrane-daemon-test-{}.sock", std::process::id()));
    let device = RelayDevice::manual(DisplayMode::default());
    let server = RelayServer::bind(&path).unwrap();
    {
        let device = device.clone();
        thread::spawn(move || server.run(&device));
    }

    let config = DaemonConfig {
        backlight: false,
        ..DaemonConfig::default()
    };
    let allocator = FakeAllocator::new(640);
    let compositor = FakeCompositor::new(DisplayConfig {
        width: 640,
        height: 480,
        vsync_period_ns: 13_333_333,
    });
    let daemon = Daemon::connect(&path, allocator.clone(), compositor, &config)
        .expect("Failed to connect daemon");
    assert!(daemon.policy().backlight().is_none());
    assert_eq!(
        device.mode(),
        DisplayMode {
            width: 640,
            height: 480,
            refresh: 75,
        }
    );

    drop(daemon);
    assert_eq!(allocator.live(), 0);
    let _ = std::fs::remove_file(&path);
}
