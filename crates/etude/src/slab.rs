// src/slab.rs
use crate::conn::Connection;
use crate::error::{EtudeError, EtudeResult};
use crate::sync::lock;
use libc::c_int;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Stable handle for a slot: index plus the generation it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub index: u32,
    pub generation: u32,
}

impl SlotId {
    pub fn token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

/// Fixed arena of connections addressed by slot index, never by descriptor.
///
/// Each slot has its own lock. Under the oneshot protocol only one job holds
/// a given slot at a time, so the lock is normally uncontended.
pub struct ConnectionTable {
    slots: Box<[Mutex<Connection>]>,
    free: Mutex<Vec<u32>>,
    active_count: AtomicUsize,
}

impl ConnectionTable {
    /// Allocate every slot and its buffers up front.
    pub fn new(capacity: usize, read_capacity: usize, write_capacity: usize) -> Self {
        let slots: Vec<_> = (0..capacity)
            .map(|_| Mutex::new(Connection::new(read_capacity, write_capacity)))
            .collect();
        // Reversed so the lowest index is handed out first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
            active_count: AtomicUsize::new(0),
        }
    }

    /// Claim a free slot for `fd`.
    pub fn allocate(&self, fd: c_int, peer: Option<SocketAddr>) -> EtudeResult<SlotId> {
        let index = lock(&self.free).pop().ok_or(EtudeError::TableFull)?;
        let mut conn = lock(&self.slots[index as usize]);
        conn.open(fd, peer);
        self.active_count.fetch_add(1, Ordering::Relaxed);
        Ok(SlotId {
            index,
            generation: conn.generation,
        })
    }

    /// Lock the slot if `id` still names its current, open occupant.
    pub fn get(&self, id: SlotId) -> Option<MutexGuard<'_, Connection>> {
        let slot = self.slots.get(id.index as usize)?;
        let conn = lock(slot);
        if conn.generation != id.generation || !conn.is_open() {
            return None;
        }
        Some(conn)
    }

    /// Release the occupant and put the index back on the free list.
    ///
    /// Takes the held guard so no other thread can observe the slot between
    /// release and reuse. The descriptor is not closed here.
    pub fn free(&self, id: SlotId, mut conn: MutexGuard<'_, Connection>) {
        if conn.generation != id.generation || !conn.is_open() {
            return; // already freed
        }
        conn.release();
        drop(conn);
        lock(&self.free).push(id.index);
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Ids of every open slot, for shutdown.
    pub fn open_slots(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let conn = lock(slot);
                conn.is_open().then(|| SlotId {
                    index: index as u32,
                    generation: conn.generation,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
