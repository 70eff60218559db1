//! Interval-tree heap.
//!
//! Every block, used or free, is one entry of a [`RangeMap`] keyed by its
//! address. A free block advertises its size as the entry's range; a used
//! block advertises zero. Fit queries ride the map's cached subtree windows
//! straight to a satisfying free block, and coalescing is a pair of
//! neighbor lookups followed by one re-insert, so no memory inside a block
//! is ever touched by the allocator itself. That makes this engine the one
//! to pick when blocks must carry no tags at all.
//!
//! Growth doubles the growth base each step and extends the last free span
//! in place whenever the OS happens to hand back adjacent pages.

use twinheap_pages::mem;
use twinheap_pages::{die, DefaultProvider, HeapFault};

use crate::block::{pad_for, BLOCK_CEILING};
use crate::config::HeapConfig;
use crate::contract::{grant, DebugHooks, Heap};
use crate::journal::{EventJournal, HeapEvent, JOURNAL_DEPTH};
use crate::rangemap::RangeMap;

use std::ptr::NonNull;

/// Per-block metadata stored as the tree entry's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockInfo {
    size: u32,
    align: u32,
    free: bool,
}

/// One block as seen by [`TreeHeap::block_spans`]: an address-ordered walk
/// of the tree for reports and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSpan {
    pub addr: usize,
    pub size: usize,
    pub free: bool,
}

/// Heap that keeps every block as an interval-tree entry.
pub struct TreeHeap {
    provider: DefaultProvider,
    blocks: RangeMap<usize, BlockInfo, usize>,
    config: HeapConfig,
    journal: EventJournal,
    hooks: Option<Box<dyn DebugHooks>>,
    /// Footprint of the original reservation; a cleared heap regrows from
    /// here before doubling.
    initial: usize,
    /// Growth base: doubles on every growth step.
    grown: usize,
    in_use: usize,
}

impl TreeHeap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        config.validate();
        let mut heap = TreeHeap {
            provider: DefaultProvider::new(),
            blocks: RangeMap::new(config.arena_slab_bytes),
            config,
            journal: EventJournal::with_capacity(JOURNAL_DEPTH),
            hooks: None,
            initial: 0,
            grown: 0,
            in_use: 0,
        };
        heap.preallocate(config.initial_footprint);
        heap
    }

    /// Reserves `bytes` up front as one free span and resets the growth
    /// base to it. `bytes` must be nonzero.
    pub fn preallocate(&mut self, bytes: usize) {
        if bytes == 0 {
            die(HeapFault::ZeroSizeRequest);
        }
        if bytes > self.config.max_footprint {
            die(HeapFault::OversizeRequest {
                requested: bytes,
                ceiling: self.config.max_footprint,
            });
        }
        if bytes > BLOCK_CEILING as usize {
            die(HeapFault::OversizeRequest {
                requested: bytes,
                ceiling: BLOCK_CEILING as usize,
            });
        }
        let span = self.provider.acquire(bytes);
        let size = span.len.min(BLOCK_CEILING as usize);
        self.blocks.put(
            span.addr,
            BlockInfo {
                size: size as u32,
                align: 1,
                free: true,
            },
            size,
        );
        self.initial = bytes;
        self.grown = bytes;
        self.journal.record(HeapEvent::Preallocate {
            requested: bytes,
            granted: span.len,
        });
        self.note_region(span.addr, span.len);
    }

    /// Drops every entry and region. The growth base survives the clear.
    pub fn clear(&mut self) {
        let dropped = self.blocks.len();
        self.blocks.clear();
        self.provider.teardown();
        self.in_use = 0;
        self.journal.record(HeapEvent::Clear {
            dropped_blocks: dropped,
        });
    }

    pub fn install_debug_hooks(&mut self, hooks: Box<dyn DebugHooks>) {
        self.hooks = Some(hooks);
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn drain_journal(&mut self) -> Vec<HeapEvent> {
        self.journal.take_all()
    }

    /// Every block in address order.
    #[must_use]
    pub fn block_spans(&self) -> Vec<BlockSpan> {
        self.blocks
            .iter()
            .map(|entry| BlockSpan {
                addr: entry.key,
                size: entry.val.size as usize,
                free: entry.val.free,
            })
            .collect()
    }

    /// Test auditor: structural tree checks plus the allocator's own rules.
    /// A free block's range is its size, a used block's range is zero, and
    /// the used sizes sum to the bytes-in-use counter.
    pub fn audit(&self) {
        self.blocks.verify_invariants();
        let mut used_bytes = 0usize;
        let mut free_seen = 0usize;
        for entry in self.blocks.iter() {
            let range = self.blocks.range_at(entry.key);
            assert!(entry.val.size > 0, "no zero-size blocks");
            if entry.val.free {
                assert_eq!(
                    range,
                    entry.val.size as usize,
                    "free block advertises its size"
                );
                free_seen += 1;
            } else {
                assert_eq!(range, 0, "used block advertises nothing");
                used_bytes += entry.val.size as usize;
            }
        }
        assert_eq!(used_bytes, self.in_use);
        assert_eq!(free_seen, self.free_block_count());
    }

    /// Carves the head of a fitting free entry. The fit query rides the
    /// cached range windows; the padding test keeps misaligned candidates
    /// honest about their effective size.
    fn acquire_block(&mut self, size: usize, align: usize) -> Option<usize> {
        if !self.config.skip_defensive_checks {
            if size == 0 {
                die(HeapFault::ZeroSizeRequest);
            }
            if size.saturating_add(align) > BLOCK_CEILING as usize {
                die(HeapFault::OversizeRequest {
                    requested: size.saturating_add(align),
                    ceiling: BLOCK_CEILING as usize,
                });
            }
            if align == 0 || !align.is_power_of_two() {
                die(HeapFault::UnusableAlignment { align });
            }
        }
        let fit = self.blocks.range_fit(size, BLOCK_CEILING as usize, |key, info| {
            info.size as usize >= size + pad_for(key, align)
        })?;

        let padding = pad_for(fit.key, align);
        let spare = fit.val.size - size as u32 - padding as u32;
        let user = fit.key + padding;
        self.blocks.put(
            user,
            BlockInfo {
                size: size as u32,
                align: align as u32,
                free: false,
            },
            0,
        );
        if padding > 0 {
            self.blocks.put(
                fit.key,
                BlockInfo {
                    size: padding as u32,
                    align: 1,
                    free: true,
                },
                padding,
            );
        }
        if spare > 0 {
            self.blocks.put(
                user + size,
                BlockInfo {
                    size: spare,
                    align: 1,
                    free: true,
                },
                spare as usize,
            );
        }
        self.in_use += size;
        self.note_block_acquired(user, size);
        Some(user)
    }

    /// Returns a block to the free state, unifying it with whichever
    /// address neighbors are free and contiguous. The survivor is a single
    /// entry at the leftmost address of the run.
    fn free_block(&mut self, addr: usize, info: BlockInfo) {
        if !self.config.skip_defensive_checks && info.free {
            die(HeapFault::DoubleRelease { addr });
        }
        self.in_use -= info.size as usize;
        if self.config.eager_zero_on_release {
            mem::fill_zero(&self.provider, addr, info.size as usize);
        }

        let mut unified = info.size;
        let mut free_at = addr;
        let mut eat_next = None;
        let mut eat_prev = None;

        if let Some(next) = self.blocks.next(addr) {
            if next.val.free && addr + info.size as usize == next.key {
                unified += next.val.size;
                eat_next = Some(next.key);
            }
        }
        if let Some(prev) = self.blocks.prev(addr) {
            if prev.val.free && prev.key + prev.val.size as usize == addr {
                unified += prev.val.size;
                free_at = prev.key;
                eat_prev = Some(prev.key);
            }
        }
        if let Some(key) = eat_next {
            self.blocks.remove(key);
        }
        if let Some(key) = eat_prev {
            self.blocks.remove(key);
        }
        self.blocks.remove(addr);
        self.blocks.put(
            free_at,
            BlockInfo {
                size: unified,
                align: 1,
                free: true,
            },
            unified as usize,
        );
    }

    /// Doubles the growth base, adds `min_size` on top, and asks the OS for
    /// that much more. An adjacent grant extends the last free span instead
    /// of appearing as a separate one.
    fn grow(&mut self, min_size: usize) {
        if min_size > BLOCK_CEILING as usize {
            die(HeapFault::OversizeRequest {
                requested: min_size,
                ceiling: BLOCK_CEILING as usize,
            });
        }
        if self.blocks.is_empty() {
            // A cleared heap re-reserves its original footprint first.
            self.preallocate(self.initial);
        }
        let Some(last) = self.blocks.last() else {
            die(HeapFault::NoFit { size: min_size });
        };
        if self.grown >= self.config.max_footprint {
            die(HeapFault::FootprintCeiling {
                max_footprint: self.config.max_footprint,
            });
        }
        self.grown = self.grown + self.grown + min_size;
        let span = self.provider.acquire(self.grown);
        self.journal.record(HeapEvent::Grow {
            requested: self.grown,
            granted: span.len,
            reserved: self.provider.bytes_reserved(),
        });
        let adjacent = last.val.free && last.key + last.val.size as usize == span.addr;
        let combined = last.val.size as usize + span.len;
        if adjacent && combined <= BLOCK_CEILING as usize {
            self.blocks.put(
                last.key,
                BlockInfo {
                    size: combined as u32,
                    align: 1,
                    free: true,
                },
                combined,
            );
        } else {
            let size = span.len.min(BLOCK_CEILING as usize);
            self.blocks.put(
                span.addr,
                BlockInfo {
                    size: size as u32,
                    align: 1,
                    free: true,
                },
                size,
            );
        }
        self.note_region(span.addr, span.len);
    }

    fn note_block_acquired(&mut self, addr: usize, size: usize) {
        if !self.config.enable_memory_debugger_hooks {
            return;
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.block_acquired(addr, size);
        }
    }

    fn note_block_released(&mut self, addr: usize, size: usize) {
        if !self.config.enable_memory_debugger_hooks {
            return;
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.block_released(addr, size);
        }
    }

    fn note_region(&mut self, addr: usize, len: usize) {
        if !self.config.enable_memory_debugger_hooks {
            return;
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.region_granted(addr, len);
        }
    }
}

impl Heap for TreeHeap {
    fn allocate(&mut self, size: usize, align: usize) -> NonNull<u8> {
        if !self.config.skip_defensive_checks && size == 0 {
            die(HeapFault::ZeroSizeRequest);
        }
        if size > self.config.max_footprint {
            die(HeapFault::OversizeRequest {
                requested: size,
                ceiling: self.config.max_footprint,
            });
        }
        if let Some(user) = self.acquire_block(size, align) {
            return grant(user);
        }
        self.grow(size.saturating_add(align));
        if let Some(user) = self.acquire_block(size, align) {
            return grant(user);
        }
        die(HeapFault::NoFit { size })
    }

    fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 || ptr.is_null() {
            self.release(ptr);
            return None;
        }
        let addr = ptr as usize;
        let info = self.blocks.at(addr);
        if !self.config.skip_defensive_checks && info.free {
            die(HeapFault::ResizeOfFreeBlock { addr });
        }
        if new_size == info.size as usize {
            return Some(grant(addr));
        }

        if new_size < info.size as usize {
            let spare = info.size - new_size as u32;
            self.blocks.put(
                addr,
                BlockInfo {
                    size: new_size as u32,
                    align: info.align,
                    free: false,
                },
                0,
            );
            let tail = addr + new_size;
            let tail_info = BlockInfo {
                size: spare,
                align: 1,
                free: false,
            };
            self.blocks.put(tail, tail_info, 0);
            self.free_block(tail, tail_info);
            self.note_block_released(addr, info.size as usize);
            self.note_block_acquired(addr, new_size);
            return Some(grant(addr));
        }

        // Grow in place if the successor is free, contiguous, and roomy.
        let need = new_size as u32 - info.size;
        if let Some(next) = self.blocks.next(addr) {
            if next.val.free
                && addr + info.size as usize == next.key
                && next.val.size >= need
            {
                let leftover = next.val.size - need;
                self.blocks.remove(next.key);
                self.blocks.put(
                    addr,
                    BlockInfo {
                        size: new_size as u32,
                        align: info.align,
                        free: false,
                    },
                    0,
                );
                if leftover > 0 {
                    self.blocks.put(
                        addr + new_size,
                        BlockInfo {
                            size: leftover,
                            align: 1,
                            free: true,
                        },
                        leftover as usize,
                    );
                }
                self.in_use += need as usize;
                self.note_block_released(addr, info.size as usize);
                self.note_block_acquired(addr, new_size);
                return Some(grant(addr));
            }
        }

        // Move: fresh block at the stored alignment, payload copied, old
        // block released.
        let fresh = self.allocate(new_size, info.align as usize);
        let fresh_addr = fresh.as_ptr() as usize;
        mem::copy(
            &self.provider,
            addr,
            fresh_addr,
            new_size.min(info.size as usize),
        );
        self.note_block_released(addr, info.size as usize);
        self.free_block(addr, info);
        Some(fresh)
    }

    fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr as usize;
        let info = self.blocks.at(addr);
        self.note_block_released(addr, info.size as usize);
        self.free_block(addr, info);
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    fn bytes_reserved(&self) -> usize {
        self.provider.bytes_reserved() + self.blocks.bytes_reserved()
    }

    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn free_block_count(&self) -> usize {
        self.blocks.iter().filter(|entry| entry.val.free).count()
    }
}

impl Default for TreeHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> TreeHeap {
        TreeHeap::with_config(
            HeapConfig::default()
                .with_initial_footprint(1 << 16)
                .with_arena_slab_bytes(1 << 12),
        )
    }

    fn assert_contiguous(spans: &[BlockSpan]) {
        for pair in spans.windows(2) {
            assert_eq!(
                pair[0].addr + pair[0].size,
                pair[1].addr,
                "blocks tile the region without gaps"
            );
        }
    }

    #[test]
    fn fresh_heap_is_one_free_span() {
        let heap = small_heap();
        let spans = heap.block_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].free);
        assert_eq!(spans[0].size, 1 << 16);
        assert_eq!(heap.bytes_in_use(), 0);
        heap.audit();
    }

    #[test]
    fn allocation_carves_the_head_of_the_fit() {
        let mut heap = small_heap();
        let start = heap.block_spans()[0].addr;
        let a = heap.allocate(100, 1);
        assert_eq!(a.as_ptr() as usize, start);
        let spans = heap.block_spans();
        assert_eq!(spans.len(), 2);
        assert!(!spans[0].free);
        assert_eq!(spans[0].size, 100);
        assert!(spans[1].free);
        assert_contiguous(&spans);
        assert_eq!(heap.bytes_in_use(), 100);
        heap.audit();
    }

    #[test]
    fn alignment_padding_becomes_its_own_free_stub() {
        let mut heap = small_heap();
        let _head = heap.allocate(8, 1);
        let b = heap.allocate(100, 64);
        assert_eq!(b.as_ptr() as usize % 64, 0);
        let spans = heap.block_spans();
        // used 8, free padding stub, used 100, free remainder
        assert_eq!(spans.len(), 4);
        assert!(spans[1].free);
        assert_eq!(spans[1].size, 56);
        assert_contiguous(&spans);
        heap.audit();
    }

    #[test]
    fn release_coalesces_across_both_neighbors() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        let b = heap.allocate(64, 1);
        let c = heap.allocate(64, 1);
        heap.release(a.as_ptr());
        heap.audit();
        heap.release(c.as_ptr());
        heap.audit();
        heap.release(b.as_ptr());
        let spans = heap.block_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].free);
        assert_eq!(spans[0].size, 1 << 16);
        assert_eq!(heap.bytes_in_use(), 0);
        heap.audit();
    }

    #[test]
    fn every_rest_point_tiles_the_region() {
        let mut heap = small_heap();
        let a = heap.allocate(48, 1);
        assert_contiguous(&heap.block_spans());
        let b = heap.allocate(200, 16);
        assert_contiguous(&heap.block_spans());
        heap.release(a.as_ptr());
        assert_contiguous(&heap.block_spans());
        let c = heap.allocate(16, 1);
        assert_contiguous(&heap.block_spans());
        heap.release(b.as_ptr());
        assert_contiguous(&heap.block_spans());
        heap.release(c.as_ptr());
        assert_contiguous(&heap.block_spans());
        heap.audit();
    }

    #[test]
    fn shrink_returns_the_tail_to_the_free_span() {
        let mut heap = small_heap();
        let a = heap.allocate(256, 1);
        let same = heap.resize(a.as_ptr(), 64);
        assert_eq!(same, Some(a));
        let spans = heap.block_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].size, 64);
        assert!(spans[1].free);
        assert_eq!(heap.bytes_in_use(), 64);
        assert_contiguous(&spans);
        heap.audit();
    }

    #[test]
    fn grow_in_place_splits_a_roomy_successor() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        let wider = heap.resize(a.as_ptr(), 100);
        assert_eq!(wider, Some(a));
        assert_eq!(heap.bytes_in_use(), 100);
        let spans = heap.block_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].size, 100);
        assert_contiguous(&spans);
        heap.audit();
    }

    #[test]
    fn grow_in_place_consumes_an_exact_successor() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        let b = heap.allocate(36, 1);
        let _pin = heap.allocate(8, 1);
        heap.release(b.as_ptr());
        let before = heap.block_count();
        let wider = heap.resize(a.as_ptr(), 100);
        assert_eq!(wider, Some(a));
        // The free successor vanished whole; no zero-size stub remains.
        assert_eq!(heap.block_count(), before - 1);
        assert_contiguous(&heap.block_spans());
        heap.audit();
    }

    #[test]
    fn resize_moves_when_blocked() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        let _pin = heap.allocate(8, 1);
        let moved = heap.resize(a.as_ptr(), 300).unwrap();
        assert_ne!(moved, a);
        assert_eq!(heap.bytes_in_use(), 308);
        assert_contiguous(&heap.block_spans());
        heap.audit();
    }

    #[test]
    fn resize_to_zero_releases() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        assert_eq!(heap.resize(a.as_ptr(), 0), None);
        assert_eq!(heap.bytes_in_use(), 0);
        assert_eq!(heap.block_count(), 1);
        heap.audit();
    }

    #[test]
    fn growth_is_journaled_and_audited() {
        let mut heap = TreeHeap::with_config(
            HeapConfig::default().with_initial_footprint(1 << 13),
        );
        let reserved = heap.bytes_reserved();
        let big = heap.allocate(60_000, 1);
        assert!(heap.bytes_reserved() > reserved);
        assert!(
            heap.drain_journal()
                .iter()
                .any(|event| matches!(event, HeapEvent::Grow { .. }))
        );
        heap.release(big.as_ptr());
        heap.audit();
    }

    #[test]
    fn clear_then_reallocate_regrows() {
        let mut heap = small_heap();
        let _a = heap.allocate(64, 1);
        heap.clear();
        assert_eq!(heap.block_count(), 0);
        assert_eq!(heap.bytes_in_use(), 0);
        let fresh = heap.allocate(64, 1);
        heap.release(fresh.as_ptr());
        heap.audit();
        let events = heap.drain_journal();
        assert!(
            events
                .iter()
                .any(|event| matches!(event, HeapEvent::Clear { .. }))
        );
        // The regrow re-reserves the original footprint before doubling.
        assert!(
            events
                .iter()
                .filter(|event| matches!(event, HeapEvent::Preallocate { .. }))
                .count()
                >= 2
        );
    }

    #[test]
    fn eager_zeroing_keeps_the_structure_intact() {
        let mut heap = TreeHeap::with_config(
            HeapConfig::default()
                .with_initial_footprint(1 << 16)
                .with_eager_zeroing(),
        );
        let a = heap.allocate(64, 1);
        heap.release(a.as_ptr());
        let again = heap.allocate(64, 1);
        assert_eq!(a, again);
        heap.audit();
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Configuration]")]
    fn zero_size_allocation_is_fatal() {
        let mut heap = small_heap();
        let _ = heap.allocate(0, 1);
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Configuration]")]
    fn zero_preallocation_is_fatal() {
        let mut heap = small_heap();
        heap.preallocate(0);
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Configuration]")]
    fn oversize_request_is_fatal() {
        let mut heap = TreeHeap::with_config(
            HeapConfig::default()
                .with_initial_footprint(1 << 16)
                .with_max_footprint(1 << 20),
        );
        let _ = heap.allocate((1 << 20) + 1, 1);
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Configuration]")]
    fn footprint_ceiling_stops_growth() {
        let mut heap = TreeHeap::with_config(
            HeapConfig::default()
                .with_initial_footprint(1 << 14)
                .with_max_footprint(1 << 16),
        );
        for _ in 0..64 {
            let _ = heap.allocate(1 << 12, 1);
        }
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Corruption]")]
    fn release_of_an_unknown_pointer_is_fatal() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        heap.release(a.as_ptr().wrapping_add(1));
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Corruption]")]
    fn double_release_is_fatal() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        let _pin = heap.allocate(8, 1);
        heap.release(a.as_ptr());
        heap.release(a.as_ptr());
    }

    #[test]
    #[should_panic(expected = "fatal heap fault [Corruption]")]
    fn resize_of_a_free_block_is_fatal() {
        let mut heap = small_heap();
        let a = heap.allocate(64, 1);
        let _pin = heap.allocate(8, 1);
        heap.release(a.as_ptr());
        let _ = heap.resize(a.as_ptr(), 128);
    }

    #[test]
    fn debug_hooks_balance_over_a_lifecycle() {
        use std::cell::Cell;
        use std::rc::Rc;

        #[derive(Clone, Default)]
        struct Ledger {
            outstanding: Rc<Cell<isize>>,
        }
        impl DebugHooks for Ledger {
            fn block_acquired(&mut self, _addr: usize, _size: usize) {
                self.outstanding.set(self.outstanding.get() + 1);
            }
            fn block_released(&mut self, _addr: usize, _size: usize) {
                self.outstanding.set(self.outstanding.get() - 1);
            }
        }

        let mut heap = TreeHeap::with_config(
            HeapConfig::default()
                .with_initial_footprint(1 << 16)
                .with_debugger_hooks(),
        );
        let ledger = Ledger::default();
        heap.install_debug_hooks(Box::new(ledger.clone()));
        let a = heap.allocate(64, 1);
        let b = heap.resize(a.as_ptr(), 300).unwrap();
        heap.release(b.as_ptr());
        assert_eq!(ledger.outstanding.get(), 0);
    }
}
