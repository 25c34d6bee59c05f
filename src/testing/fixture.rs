//! Relay test fixture
//!
//! A manually ticked `RelayDevice` with one open producer `Client`. Tests
//! drive VBlanks themselves, so every run is deterministic.

use std::sync::Arc;

use tracing::info;

use crate::buffer::{metadata_memfd, BufferRef, DmaBuf};
use crate::daemon::hal::DisplayConfig;
use crate::device::{Client, ConsumerLink, RelayDevice};
use crate::event::DisplayMode;
use crate::framebuffer::Framebuffer;
use crate::pacer::Tick;

use super::fakes::TestBuffer;

pub struct RelayFixture {
    // Declared first so it closes before the device handle goes away.
    client: Client,
    device: RelayDevice,
}

impl Default for RelayFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayFixture {
    pub fn new() -> Self {
        Self::with_mode(DisplayMode::default())
    }

    pub fn with_mode(mode: DisplayMode) -> Self {
        let device = RelayDevice::manual(mode);
        let client = device.open_client();
        info!("relay fixture initialized");
        Self { client, device }
    }

    pub fn device(&self) -> &RelayDevice {
        &self.device
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn attach_consumer(&self) -> ConsumerLink {
        self.device
            .attach_consumer()
            .expect("fixture consumer already attached")
    }

    /// Framebuffer over freshly registered buffers, one per plane.
    ///
    /// Returns the buffers too, for reference counting checks.
    pub fn framebuffer(&self, planes: usize) -> (Framebuffer, Vec<Arc<TestBuffer>>) {
        let buffers: Vec<_> = (0..planes).map(|_| TestBuffer::new()).collect();
        let handles: Vec<_> = buffers
            .iter()
            .map(|buffer| self.client.register_buffer(buffer.clone()))
            .collect();
        let fb = self
            .client
            .create_framebuffer(&handles)
            .expect("create framebuffer");
        (fb, buffers)
    }

    /// Framebuffer the daemon can import: one pixel plane followed by a
    /// metadata handle carrying `metadata`.
    pub fn importable_framebuffer_with(&self, metadata: &[u8]) -> (Framebuffer, Arc<TestBuffer>) {
        let plane = TestBuffer::new();
        let meta: BufferRef = DmaBuf::new(metadata_memfd(metadata).expect("memfd_create")).into_ref();
        let handles = [
            self.client.register_buffer(plane.clone()),
            self.client.register_buffer(meta),
        ];
        let fb = self
            .client
            .create_framebuffer(&handles)
            .expect("create framebuffer");
        (fb, plane)
    }

    pub fn importable_framebuffer(&self) -> (Framebuffer, Arc<TestBuffer>) {
        self.importable_framebuffer_with(b"native-handle")
    }

    pub fn commit_and_tick(&self, fb: &Framebuffer) -> Tick {
        self.client.commit(fb);
        self.device.tick()
    }

    /// Compositor display config matching the device's current mode.
    pub fn display_config(&self) -> DisplayConfig {
        let mode = self.device.mode();
        DisplayConfig {
            width: mode.width,
            height: mode.height,
            vsync_period_ns: 1_000_000_000 / i64::from(mode.refresh.max(1)),
        }
    }
}
