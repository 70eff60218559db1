//! Fixed-size-record metadata arena.
//!
//! One [`SlotArena`] instance hosts exactly one record type. Records live in
//! provider-backed slabs and are addressed by a dense `u32` [`SlotIndex`]; the
//! arena is the sole owner of every record, and indices held elsewhere are
//! weak references that the single-threaded call discipline keeps honest.
//! Allocation is O(1): pop the intrusive free-slot stack, else bump a cursor.
//! Releasing the most recently bumped slot retracts the cursor instead of
//! stacking, so tight create/destroy pairs reclaim contiguous space for free.
//!
//! The free-slot stack is intrusive: a freed slot's leading four bytes store
//! the index of the next free slot. Nothing else is written on release, so a
//! stale index into a freed slot reads garbage, never unmapped memory.
//!
//! Slabs grow monotonically and are never individually released; [`reset`]
//! recycles every slot at once while keeping the reservation.
//!
//! [`reset`]: SlotArena::reset

use core::marker::PhantomData;

use crate::fault::{HeapFault, die};
use crate::provider::DefaultProvider;

/// Dense handle to an arena record.
pub type SlotIndex = u32;

/// Reserved index meaning "no slot".
pub const NIL: SlotIndex = SlotIndex::MAX;

struct Slab {
    /// First index hosted by this slab. Slabs are appended in index order.
    base: SlotIndex,
    cap: u32,
    addr: usize,
}

/// Growable table of fixed-size `R` records with O(1) allocate/release.
pub struct SlotArena<R: Copy> {
    provider: DefaultProvider,
    slabs: Vec<Slab>,
    slab_bytes: usize,
    /// Total slots across all slabs.
    capacity: u32,
    /// Next never-bumped index; every live or stacked index is below it.
    cursor: u32,
    free_head: SlotIndex,
    free_count: u32,
    _record: PhantomData<R>,
}

impl<R: Copy> SlotArena<R> {
    /// `slab_bytes` is the region size requested per growth step.
    #[must_use]
    pub fn new(slab_bytes: usize) -> Self {
        let size = core::mem::size_of::<R>();
        let align = core::mem::align_of::<R>();
        assert!(size >= 4, "records must have room for the free-stack link");
        assert!(
            (4..=16).contains(&align),
            "record alignment must fit provider region alignment"
        );
        assert!(slab_bytes >= size, "slab must hold at least one record");
        Self {
            provider: DefaultProvider::new(),
            slabs: Vec::new(),
            slab_bytes,
            capacity: 0,
            cursor: 0,
            free_head: NIL,
            free_count: 0,
            _record: PhantomData,
        }
    }

    /// Store `record` in a fresh slot and return its index.
    pub fn allocate_slot(&mut self, record: R) -> SlotIndex {
        let idx = if self.free_head != NIL {
            let idx = self.free_head;
            let addr = self.slot_addr(idx);
            // SAFETY: a stacked slot's leading four bytes hold the next free
            // index, written by release_slot; the slot is within a live slab.
            self.free_head = unsafe { (addr as *const SlotIndex).read() };
            self.free_count -= 1;
            idx
        } else {
            if self.cursor == self.capacity {
                self.grow();
            }
            let idx = self.cursor;
            self.cursor += 1;
            idx
        };
        // SAFETY: idx addresses a slab slot no live record occupies.
        unsafe {
            (self.slot_addr(idx) as *mut R).write(record);
        }
        idx
    }

    /// Retire a slot. The most recently bumped slot retracts the cursor;
    /// everything else goes onto the free-slot stack for reuse.
    pub fn release_slot(&mut self, idx: SlotIndex) {
        debug_assert!(idx < self.cursor, "release of a never-allocated slot");
        if idx + 1 == self.cursor {
            self.cursor -= 1;
            return;
        }
        let addr = self.slot_addr(idx);
        // SAFETY: the slot belongs to a live slab; overwriting its leading
        // bytes is fine because the record is dead from here on.
        unsafe {
            (addr as *mut SlotIndex).write(self.free_head);
        }
        self.free_head = idx;
        self.free_count += 1;
    }

    /// Read access to a live record.
    #[must_use]
    pub fn get(&self, idx: SlotIndex) -> &R {
        debug_assert!(idx < self.cursor, "index past the bump cursor");
        // SAFETY: live slots hold a valid R written by allocate_slot; index
        // liveness is the caller's single-threaded discipline, and the borrow
        // is tied to &self so the arena cannot mutate under it.
        unsafe { &*(self.slot_addr(idx) as *const R) }
    }

    /// Write access to a live record.
    pub fn get_mut(&mut self, idx: SlotIndex) -> &mut R {
        debug_assert!(idx < self.cursor, "index past the bump cursor");
        // SAFETY: as in get; &mut self makes the borrow exclusive.
        unsafe { &mut *(self.slot_addr(idx) as *mut R) }
    }

    /// Whether `idx` is below the bump cursor. True does not prove the slot
    /// is live, only that dereferencing it stays inside allocated slabs;
    /// callers validating untrusted indices still cross-check the record.
    #[must_use]
    pub fn contains(&self, idx: SlotIndex) -> bool {
        idx < self.cursor
    }

    /// Records currently allocated.
    #[must_use]
    pub fn live_slots(&self) -> usize {
        (self.cursor - self.free_count) as usize
    }

    /// Bytes held by live records.
    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.live_slots() * core::mem::size_of::<R>()
    }

    /// Bytes reserved from the OS for slabs; never decreases.
    #[must_use]
    pub fn bytes_reserved(&self) -> usize {
        self.provider.bytes_reserved()
    }

    /// Retire every slot at once, keeping the slabs for reuse.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.free_head = NIL;
        self.free_count = 0;
    }

    fn grow(&mut self) {
        let span = self.provider.acquire(self.slab_bytes);
        let size = core::mem::size_of::<R>();
        // NIL must never become addressable.
        let room = (NIL - 1 - self.capacity) as usize;
        let cap = (span.len / size).min(room) as u32;
        if cap == 0 {
            die(HeapFault::SlotSpaceExhausted);
        }
        self.slabs.push(Slab {
            base: self.capacity,
            cap,
            addr: span.addr,
        });
        self.capacity += cap;
    }

    fn slot_addr(&self, idx: SlotIndex) -> usize {
        debug_assert!(idx < self.capacity);
        let pos = self.slabs.partition_point(|s| s.base <= idx) - 1;
        let slab = &self.slabs[pos];
        debug_assert!(idx - slab.base < slab.cap);
        slab.addr + (idx - slab.base) as usize * core::mem::size_of::<R>()
    }
}
