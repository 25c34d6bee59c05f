//! Handle registry: the only place new buffer ownership enters the relay.
//!
//! Each client registration owns one registry. Handles are plain integers on
//! the wire, so every use goes back through the table; a stale or forged
//! handle resolves to `NotFound` instead of anything dangerous.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Mutex;

use tracing::trace;

use crate::buffer::{BufferRef, DmaBuf};
use crate::error::{RelayError, Result};

/// Opaque buffer handle scoped to one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

impl BufferHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct Table {
    entries: HashMap<u32, BufferRef>,
    next: u32,
}

#[derive(Debug)]
pub struct HandleRegistry {
    table: Mutex<Table>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// Take ownership of one reference and return a handle for it.
    pub fn register(&self, buffer: BufferRef) -> BufferHandle {
        let mut table = self.table.lock().unwrap();
        let mut id = table.next;
        // Skip 0 and anything still live after a wrap.
        while id == 0 || table.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        table.next = id.wrapping_add(1);
        table.entries.insert(id, buffer);
        trace!(handle = id, "registered external buffer");
        BufferHandle(id)
    }

    /// Register a buffer received as a file descriptor.
    pub fn register_fd(&self, fd: OwnedFd) -> BufferHandle {
        self.register(DmaBuf::new(fd).into_ref())
    }

    /// Look the handle up and return a fresh reference to its buffer.
    pub fn resolve(&self, handle: BufferHandle) -> Result<BufferRef> {
        let table = self.table.lock().unwrap();
        table
            .entries
            .get(&handle.0)
            .cloned()
            .ok_or(RelayError::NotFound)
    }

    /// Drop the registry's reference.
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        let removed = self.table.lock().unwrap().entries.remove(&handle.0);
        match removed {
            Some(_) => {
                trace!(handle = handle.0, "released external buffer");
                Ok(())
            }
            None => Err(RelayError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
