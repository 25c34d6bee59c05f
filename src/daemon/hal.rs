//! Collaborators the daemon drives: buffer allocator, display compositor and
//! backlight.

use std::fmt;
use std::fs;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::{debug, trace};

use crate::frame_clock::DEFAULT_REFRESH_HZ;

/// RGBA_8888
pub const PIXEL_FORMAT_RGBA_8888: u32 = 1;

/// Render, texture and composer usage.
pub const USAGE_SCANOUT: u64 = 0x200 | 0x100 | 0x800;

/// Import descriptor for relayed buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    /// In pixels. 0 until probed.
    pub stride: u32,
    pub format: u32,
    pub usage: u64,
}

impl BufferDesc {
    pub fn scanout(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: 0,
            format: PIXEL_FORMAT_RGBA_8888,
            usage: USAGE_SCANOUT,
        }
    }
}

/// The compositor's active display configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub vsync_period_ns: i64,
}

impl DisplayConfig {
    /// Refresh rate in Hz, rounded. A missing or bogus period gives 60.
    pub fn refresh_hz(&self) -> u32 {
        if self.vsync_period_ns <= 0 {
            return DEFAULT_REFRESH_HZ;
        }
        match (1e9 / self.vsync_period_ns as f64).round() as u32 {
            0 => DEFAULT_REFRESH_HZ,
            hz => hz,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Off,
    On,
}

pub trait Allocator {
    type Buffer: fmt::Debug;

    /// Allocate a buffer, returning it with its stride.
    fn allocate(&mut self, desc: &BufferDesc) -> anyhow::Result<(Self::Buffer, u32)>;

    fn release(&mut self, buffer: Self::Buffer);

    /// Import a relayed buffer from its plane handles and metadata blob.
    fn import(
        &mut self,
        planes: Vec<OwnedFd>,
        metadata: &[u8],
        desc: &BufferDesc,
    ) -> anyhow::Result<Self::Buffer>;
}

pub trait Compositor<B> {
    fn active_config(&mut self) -> anyhow::Result<DisplayConfig>;

    /// Returns true if the compositor requested changes.
    fn validate(&mut self) -> anyhow::Result<bool>;

    fn accept_changes(&mut self) -> anyhow::Result<()>;

    fn set_layer_buffer(&mut self, buffer: &B, acquire_fence: Option<OwnedFd>) -> anyhow::Result<()>;

    /// Returns the release fence, if any.
    fn present(&mut self) -> anyhow::Result<Option<OwnedFd>>;

    fn set_power_mode(&mut self, mode: PowerMode) -> anyhow::Result<()>;
}

pub trait Backlight {
    fn get_level(&mut self) -> anyhow::Result<u32>;

    fn set_level(&mut self, level: u32, flags: u32) -> anyhow::Result<()>;
}

const SYSFS_BACKLIGHT: &str = "/sys/class/backlight";

/// Backlight behind `/sys/class/backlight/<name>/brightness`.
#[derive(Debug, Clone)]
pub struct SysfsBacklight {
    brightness: PathBuf,
}

impl SysfsBacklight {
    /// Open the named device, or the first one present.
    pub fn open(name: Option<&str>) -> anyhow::Result<Self> {
        let dir = match name {
            Some(name) => Path::new(SYSFS_BACKLIGHT).join(name),
            None => {
                let mut entries = fs::read_dir(SYSFS_BACKLIGHT)
                    .with_context(|| format!("listing {SYSFS_BACKLIGHT}"))?;
                match entries.next() {
                    Some(entry) => entry?.path(),
                    None => bail!("no backlight device under {SYSFS_BACKLIGHT}"),
                }
            }
        };
        Self::at(&dir)
    }

    /// Use the backlight device directory `dir`.
    pub fn at(dir: &Path) -> anyhow::Result<Self> {
        let brightness = dir.join("brightness");
        if !brightness.exists() {
            bail!("{} does not exist", brightness.display());
        }
        debug!("backlight: {}", brightness.display());
        Ok(Self { brightness })
    }
}

impl Backlight for SysfsBacklight {
    fn get_level(&mut self) -> anyhow::Result<u32> {
        let text = fs::read_to_string(&self.brightness)
            .with_context(|| format!("reading {}", self.brightness.display()))?;
        text.trim()
            .parse()
            .with_context(|| format!("parsing brightness {:?}", text.trim()))
    }

    fn set_level(&mut self, level: u32, flags: u32) -> anyhow::Result<()> {
        trace!(level, flags, "set backlight");
        fs::write(&self.brightness, level.to_string())
            .with_context(|| format!("writing {}", self.brightness.display()))
    }
}
