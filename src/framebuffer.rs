//! Framebuffers: the producer-facing scanout objects.

use crate::buffer::BufferRef;
use crate::error::{RelayError, Result};
use crate::registry::{BufferHandle, HandleRegistry};

/// Pixel planes plus metadata, at most.
pub const MAX_PLANES: usize = 4;

/// A framebuffer holds one reference per plane for as long as it lives.
#[derive(Debug)]
pub struct Framebuffer {
    id: u32,
    planes: Vec<(BufferHandle, BufferRef)>,
}

impl Framebuffer {
    /// Resolve `handles` against `registry`, acquiring a reference for each.
    ///
    /// Any unknown handle fails the whole creation; references acquired so
    /// far are released on return.
    pub fn new(id: u32, registry: &HandleRegistry, handles: &[BufferHandle]) -> Result<Self> {
        if handles.is_empty() {
            return Err(RelayError::InvalidArgument("framebuffer needs at least one plane"));
        }
        if handles.len() > MAX_PLANES {
            return Err(RelayError::InvalidArgument("too many framebuffer planes"));
        }

        let planes = handles
            .iter()
            .map(|&handle| registry.resolve(handle).map(|buffer| (handle, buffer)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { id, planes })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.planes.iter().map(|(handle, _)| *handle)
    }

    /// Fresh references to every plane, in order.
    pub(crate) fn acquire_buffers(&self) -> Vec<BufferRef> {
        self.planes.iter().map(|(_, buffer)| buffer.clone()).collect()
    }
}
