use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::error::{ParcelportError, Result};

/// Index plus generation of a pooled slot.
///
/// A handle stays valid from `acquire` until the matching `release`. The
/// release bumps the slot generation, so a handle kept past that point (for
/// instance inside a delayed ack) no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the handle into the 8-byte correlation tag carried on the wire.
    pub fn to_tag(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_tag(tag: u64) -> Self {
        Self { index: tag as u32, generation: (tag >> 32) as u32 }
    }
}

struct Slot<T> {
    generation: AtomicU32,
    value: T,
}

/// Fixed-capacity pool of `T` with a lock-free free list.
///
/// Slots never move, so a resolved `&T` remains usable for as long as the
/// pool lives. Synchronising access to the value itself is up to `T`.
pub struct SlotPool<T> {
    slots: Box<[Slot<T>]>,
    free: ArrayQueue<u32>,
}

impl<T> SlotPool<T> {
    pub fn new(capacity: usize, mut make: impl FnMut(usize) -> T) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(capacity <= u32::MAX as usize, "capacity must fit in u32");
        let slots = (0..capacity)
            .map(|i| Slot { generation: AtomicU32::new(0), value: make(i) })
            .collect();
        let free = ArrayQueue::new(capacity);
        for i in 0..capacity {
            // Cannot fail, the queue has exactly `capacity` places.
            let _ = free.push(i as u32);
        }
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn acquire(&self) -> Option<(Handle, &T)> {
        let index = self.free.pop()?;
        let slot = &self.slots[index as usize];
        let generation = slot.generation.load(Ordering::Acquire);
        Some((Handle { index, generation }, &slot.value))
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        let slot = self.slots.get(handle.index as usize).ok_or(stale(handle))?;
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return Err(stale(handle));
        }
        Ok(&slot.value)
    }

    /// Returns the slot to the free list. This must be the last use of
    /// `handle`; releasing the same handle twice fails.
    pub fn release(&self, handle: Handle) -> Result<()> {
        let slot = self.slots.get(handle.index as usize).ok_or(stale(handle))?;
        slot.generation
            .compare_exchange(
                handle.generation,
                handle.generation.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| stale(handle))?;
        self.free
            .push(handle.index)
            .map_err(|_| ParcelportError::Custom("slot free list overflow"))
    }

    /// Current handle and value of every slot, free or not.
    pub fn entries(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().map(|(i, s)| {
            let generation = s.generation.load(Ordering::Acquire);
            (Handle { index: i as u32, generation }, &s.value)
        })
    }
}

fn stale(handle: Handle) -> ParcelportError {
    ParcelportError::StaleHandle { index: handle.index, generation: handle.generation }
}
