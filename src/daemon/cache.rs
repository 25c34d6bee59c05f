//! Direct-mapped cache of imported buffers, keyed by present record id.
//!
//! Record ids are framebuffer ids, so a producer cycling through a fixed
//! swapchain hits the same few slots over and over. Each slot remembers the
//! full id it holds; a lookup only hits on an exact match, so a collision
//! costs a re-import and never returns the wrong buffer.

use std::rc::Rc;

pub const CACHE_SLOTS: usize = 16;

#[derive(Debug)]
struct Entry<B> {
    id: u32,
    buffer: Rc<B>,
}

#[derive(Debug)]
pub struct BufferCache<B> {
    slots: Vec<Option<Entry<B>>>,
}

impl<B> Default for BufferCache<B> {
    fn default() -> Self {
        Self::new(CACHE_SLOTS)
    }
}

impl<B> BufferCache<B> {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, id: u32) -> usize {
        id as usize % self.slots.len()
    }

    pub fn lookup(&self, id: u32) -> Option<Rc<B>> {
        match &self.slots[self.slot(id)] {
            Some(entry) if entry.id == id => Some(entry.buffer.clone()),
            _ => None,
        }
    }

    /// Store `buffer` under `id`, returning the evicted occupant.
    pub fn insert(&mut self, id: u32, buffer: Rc<B>) -> Option<Rc<B>> {
        let slot = self.slot(id);
        self.slots[slot]
            .replace(Entry { id, buffer })
            .map(|entry| entry.buffer)
    }

    /// Empty every slot, returning the occupants.
    pub fn clear(&mut self) -> Vec<Rc<B>> {
        self.slots
            .iter_mut()
            .filter_map(Option::take)
            .map(|entry| entry.buffer)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
