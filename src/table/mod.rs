//! Fixed-capacity control block tables
//!
//! Maps small integer ids to live objects (coroutines, semaphores,
//! mailboxes). Allocation scans circularly from a preferred start slot, which
//! is moved to the slot after each allocation and to each freed slot, so
//! freed ids tend to be reused first.

use crate::error::{Error, Result, TableKind};

/// A slot table with a capacity fixed at creation.
#[derive(Debug)]
pub struct ControlBlockTable<T> {
    slots: Vec<Option<T>>,
    next_free: usize,
    live: usize,
    kind: TableKind,
}

impl<T> ControlBlockTable<T> {
    /// Create a table with exactly `capacity` empty slots.
    pub fn new(kind: TableKind, capacity: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|e| {
            Error::out_of_memory(format!(
                "{} table of {} slots: {}",
                kind, capacity, e
            ))
        })?;
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            next_free: 0,
            live: 0,
            kind,
        })
    }

    /// Maximum number of simultaneously live objects.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of busy slots.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if no slot is busy.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns `true` if every slot is busy.
    pub fn is_full(&self) -> bool {
        self.live >= self.slots.len()
    }

    /// Returns `true` if `id` is within the table's range.
    pub fn in_range(&self, id: usize) -> bool {
        id < self.slots.len()
    }

    /// Returns `true` if `id` names a busy slot.
    pub fn contains(&self, id: usize) -> bool {
        matches!(self.slots.get(id), Some(Some(_)))
    }

    /// Store the value built by `make` in the next free slot and return its id.
    pub fn insert_with(&mut self, make: impl FnOnce(usize) -> T) -> Result<usize> {
        let capacity = self.slots.len();
        let id = (0..capacity)
            .map(|offset| (self.next_free + offset) % capacity)
            .find(|&i| self.slots[i].is_none())
            .ok_or(Error::CapacityExceeded {
                table: self.kind,
                capacity,
            })?;
        self.slots[id] = Some(make(id));
        self.next_free = (id + 1) % capacity;
        self.live += 1;
        Ok(id)
    }

    /// Store `value` in the next free slot and return its id.
    pub fn insert(&mut self, value: T) -> Result<usize> {
        self.insert_with(|_| value)
    }

    /// Empty slot `id`, returning its object. The slot becomes the preferred
    /// start of the next scan.
    pub fn remove(&mut self, id: usize) -> Option<T> {
        let value = self.slots.get_mut(id)?.take()?;
        self.next_free = id;
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Iterate over busy slots in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|v| (id, v)))
    }
}
