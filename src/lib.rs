//! membrane - present relay and pacing core
//!
//! Relays GPU buffer ownership from producers (clients of a `RelayDevice`) to
//! a single consumer, pacing delivery at an emulated VBlank, and carries the
//! consumer daemon that imports and presents what it receives.
pub mod buffer;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod event;
pub mod frame_clock;
pub mod framebuffer;
pub mod ipc;
pub mod logging;
pub mod pacer;
pub mod power;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod testing;
mod tracy;

pub use buffer::{BufferObject, BufferRef, DmaBuf};
pub use config::{DaemonConfig, RelayConfig, TimerMode};
pub use device::{Client, ConsumerLink, Export, RelayDevice};
pub use error::{RelayError, Result};
pub use event::{DisplayMode, EventFlags, RelayEvent};
pub use framebuffer::Framebuffer;
pub use ipc::{RelayClient, RelayServer};
pub use pacer::PacerState;
pub use power::PowerState;
pub use registry::{BufferHandle, HandleRegistry};
