//! Fake buffers and daemon collaborators.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::buffer::{fd_identity, metadata_memfd, BufferObject, BufferRef};
use crate::daemon::hal::{
    Allocator, Backlight, BufferDesc, Compositor, DisplayConfig, PowerMode,
};

/// Memfd-backed buffer object.
#[derive(Debug)]
pub struct TestBuffer {
    fd: OwnedFd,
    fail_mint: bool,
}

impl TestBuffer {
    pub fn new() -> Arc<Self> {
        Self::with_contents(b"pixels")
    }

    pub fn with_contents(contents: &[u8]) -> Arc<Self> {
        let fd = metadata_memfd(contents).expect("memfd_create");
        Arc::new(Self {
            fd,
            fail_mint: false,
        })
    }

    /// A buffer whose handle minting always fails.
    pub fn unmintable() -> Arc<Self> {
        let fd = metadata_memfd(b"").expect("memfd_create");
        Arc::new(Self {
            fd,
            fail_mint: true,
        })
    }

    pub fn new_ref() -> BufferRef {
        Self::new()
    }

    /// `(device, inode)` shared by every handle minted from this buffer.
    pub fn identity(&self) -> (u64, u64) {
        fd_identity(&self.fd).expect("fstat")
    }
}

impl BufferObject for TestBuffer {
    fn mint_handle(&self) -> io::Result<OwnedFd> {
        if self.fail_mint {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        self.fd.as_fd().try_clone_to_owned()
    }
}

/// Buffer handed out by `FakeAllocator`. Holds its imported planes open.
#[derive(Debug)]
pub struct FakeBuffer {
    pub serial: u64,
    pub planes: Vec<OwnedFd>,
}

/// One successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub serial: u64,
    pub planes: Vec<(u64, u64)>,
    pub metadata: Vec<u8>,
    pub desc: BufferDesc,
}

#[derive(Debug, Default)]
struct AllocatorState {
    next_serial: u64,
    stride: u32,
    allocations: usize,
    releases: Vec<u64>,
    imports: Vec<ImportRecord>,
    fail_imports: bool,
}

/// Allocator that records every call. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl FakeAllocator {
    pub fn new(stride: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(AllocatorState {
                next_serial: 1,
                stride,
                ..AllocatorState::default()
            })),
        }
    }

    pub fn set_fail_imports(&self, fail: bool) {
        self.state.lock().unwrap().fail_imports = fail;
    }

    pub fn allocations(&self) -> usize {
        self.state.lock().unwrap().allocations
    }

    pub fn imports(&self) -> Vec<ImportRecord> {
        self.state.lock().unwrap().imports.clone()
    }

    /// Serials of released buffers, in release order.
    pub fn releases(&self) -> Vec<u64> {
        self.state.lock().unwrap().releases.clone()
    }

    /// Buffers allocated or imported and not yet released.
    pub fn live(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.allocations + state.imports.len() - state.releases.len()
    }

    fn next_serial(state: &mut AllocatorState) -> u64 {
        let serial = state.next_serial;
        state.next_serial += 1;
        serial
    }
}

impl Allocator for FakeAllocator {
    type Buffer = FakeBuffer;

    fn allocate(&mut self, _desc: &BufferDesc) -> anyhow::Result<(FakeBuffer, u32)> {
        let mut state = self.state.lock().unwrap();
        state.allocations += 1;
        let serial = Self::next_serial(&mut state);
        let buffer = FakeBuffer {
            serial,
            planes: Vec::new(),
        };
        Ok((buffer, state.stride))
    }

    fn release(&mut self, buffer: FakeBuffer) {
        self.state.lock().unwrap().releases.push(buffer.serial);
    }

    fn import(
        &mut self,
        planes: Vec<OwnedFd>,
        metadata: &[u8],
        desc: &BufferDesc,
    ) -> anyhow::Result<FakeBuffer> {
        let mut state = self.state.lock().unwrap();
        if state.fail_imports {
            bail!("import refused");
        }
        let serial = Self::next_serial(&mut state);
        let identities = planes
            .iter()
            .map(|fd| fd_identity(fd))
            .collect::<io::Result<Vec<_>>>()?;
        state.imports.push(ImportRecord {
            serial,
            planes: identities,
            metadata: metadata.to_vec(),
            desc: *desc,
        });
        Ok(FakeBuffer { serial, planes })
    }
}

/// Everything a `FakeCompositor` was asked to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompositorCalls {
    /// Serial of each buffer bound to the layer.
    pub binds: Vec<u64>,
    pub validates: usize,
    pub accepts: usize,
    /// Serial of the bound buffer at each successful present.
    pub presents: Vec<u64>,
    pub power_modes: Vec<PowerMode>,
}

#[derive(Debug, Default)]
struct CompositorState {
    calls: CompositorCalls,
    bound: Option<u64>,
    /// Answers for upcoming validates; `false` once empty.
    validate_changes: VecDeque<bool>,
    fail_presents: bool,
}

/// Compositor that records every call. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeCompositor {
    config: DisplayConfig,
    state: Arc<Mutex<CompositorState>>,
}

impl FakeCompositor {
    pub fn new(config: DisplayConfig) -> Self {
        Self {
            config,
            state: Arc::default(),
        }
    }

    pub fn calls(&self) -> CompositorCalls {
        self.state.lock().unwrap().calls.clone()
    }

    /// Queue the result of the next validate.
    pub fn push_validate_changes(&self, changes: bool) {
        self.state
            .lock()
            .unwrap()
            .validate_changes
            .push_back(changes);
    }

    pub fn set_fail_presents(&self, fail: bool) {
        self.state.lock().unwrap().fail_presents = fail;
    }
}

impl Compositor<FakeBuffer> for FakeCompositor {
    fn active_config(&mut self) -> anyhow::Result<DisplayConfig> {
        Ok(self.config)
    }

    fn validate(&mut self) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.validates += 1;
        Ok(state.validate_changes.pop_front().unwrap_or(false))
    }

    fn accept_changes(&mut self) -> anyhow::Result<()> {
        self.state.lock().unwrap().calls.accepts += 1;
        Ok(())
    }

    fn set_layer_buffer(
        &mut self,
        buffer: &FakeBuffer,
        _acquire_fence: Option<OwnedFd>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.binds.push(buffer.serial);
        state.bound = Some(buffer.serial);
        Ok(())
    }

    fn present(&mut self) -> anyhow::Result<Option<OwnedFd>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_presents {
            bail!("present refused");
        }
        let Some(bound) = state.bound else {
            bail!("present without a layer buffer");
        };
        state.calls.presents.push(bound);
        // A real release fence; the daemon must close it.
        Ok(Some(metadata_memfd(b"")?))
    }

    fn set_power_mode(&mut self, mode: PowerMode) -> anyhow::Result<()> {
        self.state.lock().unwrap().calls.power_modes.push(mode);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BacklightState {
    level: u32,
    set_calls: usize,
}

/// In-memory backlight. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeBacklight {
    state: Arc<Mutex<BacklightState>>,
}

impl FakeBacklight {
    pub fn new(level: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BacklightState {
                level,
                set_calls: 0,
            })),
        }
    }

    pub fn level(&self) -> u32 {
        self.state.lock().unwrap().level
    }

    pub fn set_calls(&self) -> usize {
        self.state.lock().unwrap().set_calls
    }
}

impl Backlight for FakeBacklight {
    fn get_level(&mut self) -> anyhow::Result<u32> {
        Ok(self.level())
    }

    fn set_level(&mut self, level: u32, _flags: u32) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.level = level;
        state.set_calls += 1;
        Ok(())
    }
}
