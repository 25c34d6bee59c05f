//! Present records and the two single-owner slots they move between.
//!
//! A record is built once per commit and then only ever moved: commit puts
//! it into `pending`, the pacer moves it to `active`, export takes it out.
//! Every move is a single atomic exchange, and whoever displaces a record
//! owns it and drops it, which releases its buffer references.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::buffer::BufferRef;
use crate::framebuffer::Framebuffer;

/// One committed frame: the framebuffer id plus a reference per plane.
#[derive(Debug)]
pub struct PresentRecord {
    id: u32,
    buffers: Vec<BufferRef>,
}

impl PresentRecord {
    /// Capture `fb` at commit time. The framebuffer keeps its own references.
    pub fn from_framebuffer(fb: &Framebuffer) -> Box<Self> {
        Box::new(Self {
            id: fb.id(),
            buffers: fb.acquire_buffers(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> &[BufferRef] {
        &self.buffers
    }
}

/// Lock-free single-record slot.
///
/// The slot never hands out a borrow of its record; the only way to reach it
/// is to swap it out, so a record is owned by exactly one place at a time.
pub struct PresentSlot {
    ptr: AtomicPtr<PresentRecord>,
}

impl Default for PresentSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentSlot {
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Put `record` in the slot and return whatever was there.
    pub fn replace(&self, record: Option<Box<PresentRecord>>) -> Option<Box<PresentRecord>> {
        let new = record.map_or(ptr::null_mut(), Box::into_raw);
        let old = self.ptr.swap(new, Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            // SAFETY: non-null pointers in the slot always come from
            // Box::into_raw above, and the swap made us their only owner.
            Some(unsafe { Box::from_raw(old) })
        }
    }

    pub fn take(&self) -> Option<Box<PresentRecord>> {
        self.replace(None)
    }

    pub fn is_occupied(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for PresentSlot {
    fn drop(&mut self) {
        drop(self.take());
    }
}

impl std::fmt::Debug for PresentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentSlot")
            .field("occupied", &self.is_occupied())
            .finish()
    }
}

/// A record moved from `pending` into `active`.
#[derive(Debug)]
pub struct Retired {
    pub id: u32,
    pub count: usize,
    /// Previous occupant of `active`, never exported.
    pub displaced: Option<Box<PresentRecord>>,
}

/// The `pending` and `active` slots of one relay device.
#[derive(Debug, Default)]
pub struct RelaySlots {
    pending: PresentSlot,
    active: PresentSlot,
}

impl RelaySlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a freshly committed record, superseding any undelivered one.
    ///
    /// Returns the id of the superseded record, if any.
    pub fn commit(&self, record: Box<PresentRecord>) -> Option<u32> {
        self.pending.replace(Some(record)).map(|old| old.id())
    }

    /// Move `pending` into `active`.
    ///
    /// The record displaced from `active` comes back in the result, so the
    /// caller decides where its buffers are released.
    pub fn retire_pending(&self) -> Option<Retired> {
        let record = self.pending.take()?;
        let (id, count) = (record.id(), record.count());
        let displaced = self.active.replace(Some(record));
        Some(Retired {
            id,
            count,
            displaced,
        })
    }

    pub fn take_active(&self) -> Option<Box<PresentRecord>> {
        self.active.take()
    }

    /// Empty both slots and hand back what they held.
    pub fn clear(&self) -> Vec<Box<PresentRecord>> {
        [self.pending.take(), self.active.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_occupied()
    }

    pub fn has_active(&self) -> bool {
        self.active.is_occupied()
    }
}
