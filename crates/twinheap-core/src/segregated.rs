//! Segregated free-list heap.
//!
//! Free blocks park in 32 buckets by the floor of log2 of their size, with a
//! small LIFO cache in front of the buckets for sub-16-byte blocks. Every
//! block begins with an 8-byte tag that names its metadata record, so
//! `release` recovers the record from the user pointer alone and coalescing
//! reaches the address successor by hopping one tag past the payload. A
//! zeroed tag is the fence at the end of each region; the hop stops there.
//!
//! Fit scans start at the bucket whose index is the ceiling of log2 of the
//! request, so every scanned member is at least request-sized and the scan
//! usually ends at its first candidate. Growth is damped by how close the
//! heap already is to its configured ceiling.

use twinheap_pages::mem::{self, TAG_BYTES};
use twinheap_pages::{die, DefaultProvider, HeapFault, SlotArena, SlotIndex, Span, NIL};

use crate::block::{
    bucket_of, floor_log2, header_for, pad_for, parked_in_bucket, post_carve, pre_carve,
    scan_start, BlockList, BlockRecord, PostCarve, PreCarve, BLOCK_CEILING, BUCKET_COUNT,
    CACHE_BLOCK_LIMIT, CACHE_DEPTH, HOME_CACHE, HOME_USED,
};
use crate::config::{HeapConfig, DEFAULT_INITIAL_FOOTPRINT};
use crate::contract::{grant, DebugHooks, Heap};
use crate::journal::{EventJournal, HeapEvent, JOURNAL_DEPTH};

use std::ptr::NonNull;

/// Heap with power-of-two free-list buckets and a small-object cache.
pub struct SegregatedHeap {
    provider: DefaultProvider,
    records: SlotArena<BlockRecord>,
    buckets: [BlockList; BUCKET_COUNT],
    cache: BlockList,
    config: HeapConfig,
    journal: EventJournal,
    hooks: Option<Box<dyn DebugHooks>>,
    /// Lowest bucket that may hold a member. Only ever moves down between
    /// clears, so scans that start here never skip a populated bucket.
    min_bucket: u32,
    /// Growth base: bytes this heap has asked the OS for so far.
    grown: usize,
    in_use: usize,
    blocks: usize,
}

impl SegregatedHeap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        config.validate();
        let mut heap = SegregatedHeap {
            provider: DefaultProvider::new(),
            records: SlotArena::new(config.arena_slab_bytes),
            buckets: [BlockList::new(); BUCKET_COUNT],
            cache: BlockList::new(),
            config,
            journal: EventJournal::with_capacity(JOURNAL_DEPTH),
            hooks: None,
            min_bucket: BUCKET_COUNT as u32,
            grown: 0,
            in_use: 0,
            blocks: 0,
        };
        heap.preallocate(config.initial_footprint);
        heap
    }

    /// Reserves `bytes` up front as one free block. Zero means the default
    /// footprint. The reservation becomes the new growth base.
    pub fn preallocate(&mut self, bytes: usize) {
        let bytes = if bytes == 0 {
            DEFAULT_INITIAL_FOOTPRINT
        } else {
            bytes
        };
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
        let span = self.provider.acquire(bytes + TAG_BYTES);
        self.grown = bytes;
        self.journal.record(HeapEvent::Preallocate {
            requested: bytes,
            granted: span.len,
        });
        self.adopt_region(span);
    }

    /// Drops every block and region at once. The growth base survives, so
    /// the next allocation regrows from where the heap left off.
    pub fn clear(&mut self) {
        let dropped = self.blocks;
        self.buckets = [BlockList::new(); BUCKET_COUNT];
        self.cache = BlockList::new();
        self.records.reset();
        self.provider.teardown();
        self.min_bucket = BUCKET_COUNT as u32;
        self.in_use = 0;
        self.blocks = 0;
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

    /// Test auditor: walks every list and cross-checks records, tags, and
    /// counters. Panics on the first inconsistency.
    pub fn audit(&self) {
        let mut free_seen = 0;
        for (k, bucket) in self.buckets.iter().enumerate() {
            if (k as u32) < self.min_bucket {
                assert!(bucket.is_empty(), "bucket below the min-bucket hint");
            }
            let mut at = bucket.tail();
            let mut walked = 0;
            while at != NIL {
                let rec = self.records.get(at);
                assert_eq!(rec.home as usize, k, "member carries its bucket index");
                assert_eq!(bucket_of(rec.size) as usize, k, "member is size-sorted");
                assert_eq!(self.tag_at(rec.addr), Some(at), "tag names its record");
                at = rec.link_prev;
                walked += 1;
            }
            assert_eq!(walked, bucket.len());
            free_seen += walked;
        }
        let mut at = self.cache.tail();
        let mut walked = 0;
        while at != NIL {
            let rec = self.records.get(at);
            assert_eq!(rec.home, HOME_CACHE);
            assert!(rec.size > 0 && rec.size < CACHE_BLOCK_LIMIT);
            assert_eq!(self.tag_at(rec.addr), Some(at), "tag names its record");
            at = rec.link_prev;
            walked += 1;
        }
        assert_eq!(walked, self.cache.len());
        free_seen += walked;
        assert_eq!(free_seen, self.free_block_count());
        assert_eq!(self.records.live_slots(), self.blocks);
    }

    fn adopt_region(&mut self, span: Span) {
        let padding = pad_for(span.addr, TAG_BYTES);
        let usable = span.len - padding - 2 * TAG_BYTES;
        let size = usable.min(BLOCK_CEILING as usize) as u32;
        let header = span.addr + padding;
        let idx = self.create_record(header, size);
        // Zero everything past the block so the hop off its end reads a
        // fence tag, not stale bytes.
        let fence = header + TAG_BYTES + size as usize;
        mem::fill_zero(
            &self.provider,
            fence,
            span.len - (padding + TAG_BYTES + size as usize),
        );
        self.bucket_put(idx);
        self.note_region(span);
    }

    /// New record for a block at `header`, tag stamped.
    fn create_record(&mut self, header: usize, size: u32) -> SlotIndex {
        let idx = self.records.allocate_slot(BlockRecord::fresh(header, size));
        self.stamp(header, idx);
        self.blocks += 1;
        idx
    }

    fn release_record(&mut self, idx: SlotIndex) {
        self.records.release_slot(idx);
        self.blocks -= 1;
    }

    fn stamp(&mut self, header: usize, idx: SlotIndex) {
        mem::write_tag(&self.provider, header, u64::from(idx) + 1);
    }

    /// Record index named by the tag at `header`, if the tag is plausible.
    /// Zero is the fence; anything past the arena cursor is garbage.
    fn tag_at(&self, header: usize) -> Option<SlotIndex> {
        let tag = mem::read_tag(&self.provider, header);
        if tag == 0 || tag > u64::from(SlotIndex::MAX) {
            return None;
        }
        let idx = (tag - 1) as SlotIndex;
        if !self.records.contains(idx) {
            return None;
        }
        Some(idx)
    }

    /// Address successor of a block: one tag past its payload.
    fn next_of(&self, idx: SlotIndex) -> Option<SlotIndex> {
        let rec = self.records.get(idx);
        self.tag_at(rec.addr + TAG_BYTES + rec.size as usize)
    }

    /// Pulls a record out of whichever list owns it.
    fn take_free(&mut self, idx: SlotIndex) {
        let home = self.records.get(idx).home;
        debug_assert_ne!(home, HOME_USED, "record is not in any list");
        match home {
            HOME_CACHE => self.cache.remove(&mut self.records, idx),
            k => self.buckets[k as usize].remove(&mut self.records, idx),
        }
        self.records.get_mut(idx).home = HOME_USED;
    }

    /// Parks a free block in its size bucket and tightens the scan hint.
    fn bucket_put(&mut self, idx: SlotIndex) {
        let size = self.records.get(idx).size;
        let bucket = bucket_of(size);
        if !self.config.skip_defensive_checks && bucket >= BUCKET_COUNT as u32 {
            die(HeapFault::BucketOverflow { bucket });
        }
        if bucket < self.min_bucket {
            self.min_bucket = bucket;
        }
        self.records.get_mut(idx).home = bucket as u8;
        self.buckets[bucket as usize].push(&mut self.records, idx);
    }

    /// Routes a loose free block: small ones queue in the LIFO cache, the
    /// rest coalesce and park in a bucket. Cache pressure drains the oldest
    /// member through the same coalescing path.
    fn retire(&mut self, idx: SlotIndex) {
        debug_assert_eq!(self.records.get(idx).home, HOME_USED);
        if self.config.skip_small_object_cache {
            self.merge(idx);
            return;
        }
        let size = self.records.get(idx).size;
        if size == 0 || size >= CACHE_BLOCK_LIMIT {
            self.merge(idx);
            if !self.cache.is_empty() {
                let oldest = self.cache.pop_oldest(&mut self.records);
                self.records.get_mut(oldest).home = HOME_USED;
                self.merge(oldest);
            }
            return;
        }
        self.records.get_mut(idx).home = HOME_CACHE;
        self.cache.push(&mut self.records, idx);
        if self.cache.len() >= CACHE_DEPTH {
            let oldest = self.cache.pop_oldest(&mut self.records);
            self.records.get_mut(oldest).home = HOME_USED;
            self.merge(oldest);
        }
    }

    /// One-hop coalescing: absorb a free address successor, then dissolve
    /// into a free address predecessor, then park the survivor. Cache
    /// members do not take part; only bucket members are mergeable.
    fn merge(&mut self, idx: SlotIndex) {
        let mut target = idx;
        if self.records.get(target).home != HOME_USED {
            self.take_free(target);
        }

        if let Some(next) = self.next_of(target) {
            let next_rec = *self.records.get(next);
            if parked_in_bucket(next_rec.home) {
                if !self.config.skip_defensive_checks {
                    let t = self.records.get(target);
                    let edge = t.addr + TAG_BYTES + t.size as usize;
                    if next_rec.addr != edge {
                        die(HeapFault::Discontiguity {
                            left: t.addr,
                            right: next_rec.addr,
                        });
                    }
                }
                self.take_free(next);
                self.records.get_mut(target).size += next_rec.size + TAG_BYTES as u32;
                self.release_record(next);
            }
        }

        let prev = self.records.get(target).prev;
        if prev != NIL {
            let prev_rec = *self.records.get(prev);
            if parked_in_bucket(prev_rec.home) {
                let t_rec = *self.records.get(target);
                if !self.config.skip_defensive_checks {
                    let edge = prev_rec.addr + TAG_BYTES + prev_rec.size as usize;
                    if t_rec.addr != edge {
                        die(HeapFault::Discontiguity {
                            left: prev_rec.addr,
                            right: t_rec.addr,
                        });
                    }
                }
                self.take_free(prev);
                self.records.get_mut(prev).size += t_rec.size + TAG_BYTES as u32;
                self.release_record(target);
                target = prev;
            }
        }

        // The survivor may have swallowed the block its successor used as a
        // predecessor; repoint it.
        if let Some(after) = self.next_of(target) {
            self.records.get_mut(after).prev = target;
        }
        self.bucket_put(target);
    }

    /// Scans a list newest-first and carves the first member that still
    /// fits once alignment is paid for.
    fn scan_from(&mut self, mut at: SlotIndex, size: u32, align: usize) -> Option<usize> {
        while at != NIL {
            let rec = *self.records.get(at);
            let link_prev = rec.link_prev;
            if rec.size >= size {
                if !self.config.skip_defensive_checks && self.tag_at(rec.addr) != Some(at) {
                    die(HeapFault::HeaderMismatch { addr: rec.addr });
                }
                if let Some(user) = self.carve(at, size, align) {
                    return Some(user);
                }
            }
            at = link_prev;
        }
        None
    }

    /// Splits `size` aligned bytes out of the free block behind `idx`.
    ///
    /// The front of the block pays for alignment per [`pre_carve`]: either
    /// folded slack, or a split that leaves the original record as a leading
    /// stub. The tail follows [`post_carve`]: folded slack or a split-off
    /// free block. Returns `None` when alignment eats the fit entirely.
    fn carve(&mut self, idx: SlotIndex, size: u32, align: usize) -> Option<usize> {
        let rec = *self.records.get(idx);
        let payload = rec.addr + TAG_BYTES;
        let pre = pre_carve(payload, align);
        let offset = match pre {
            PreCarve::Aligned => 0,
            PreCarve::Slack { pad } => pad as usize,
            PreCarve::Fragment { keep, gap } => keep as usize + TAG_BYTES + gap as usize,
        };
        if (rec.size as usize) < offset + size as usize {
            return None;
        }
        let size_have = rec.size - offset as u32;
        let user = payload + offset;

        self.take_free(idx);

        let mut stub = NIL;
        let work = match pre {
            PreCarve::Aligned => {
                self.records.get_mut(idx).size = size;
                idx
            }
            PreCarve::Slack { pad } => {
                self.records.get_mut(idx).size = size + pad;
                idx
            }
            PreCarve::Fragment { keep, gap } => {
                {
                    let og = self.records.get_mut(idx);
                    og.size = keep;
                    og.align = 1;
                }
                let fresh = self.create_record(payload + keep as usize, size + gap);
                self.records.get_mut(fresh).prev = idx;
                stub = idx;
                fresh
            }
        };

        let mut spill = NIL;
        match post_carve(user, size_have, size) {
            PostCarve::Exact => {}
            PostCarve::Slack { dead } => {
                self.records.get_mut(work).size += dead;
            }
            PostCarve::Split { pad, size: tail } => {
                self.records.get_mut(work).size += pad;
                let tail_idx = self.create_record(user + size as usize + pad as usize, tail);
                self.records.get_mut(tail_idx).prev = work;
                spill = tail_idx;
            }
        }

        // Whatever now ends the carved stretch is the predecessor of the
        // block after it.
        let last = if spill != NIL { spill } else { work };
        if let Some(after) = self.next_of(last) {
            self.records.get_mut(after).prev = last;
        }

        self.records.get_mut(work).align = align as u32;
        let final_size = self.records.get(work).size;
        self.in_use += final_size as usize + TAG_BYTES;

        if stub != NIL {
            self.retire(stub);
        }
        if spill != NIL {
            self.retire(spill);
        }
        self.note_block_acquired(user, size as usize);
        Some(user)
    }

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
        let size = size as u32;
        if !self.config.skip_small_object_cache
            && size < CACHE_BLOCK_LIMIT
            && !self.cache.is_empty()
        {
            if let Some(user) = self.scan_from(self.cache.tail(), size, align) {
                return Some(user);
            }
        }
        let start = scan_start(size).max(self.min_bucket);
        for k in start..BUCKET_COUNT as u32 {
            if self.buckets[k as usize].is_empty() {
                continue;
            }
            if let Some(user) = self.scan_from(self.buckets[k as usize].tail(), size, align) {
                return Some(user);
            }
        }
        None
    }

    /// Asks the OS for another region. The step is the current growth base
    /// damped by proximity to the footprint ceiling, plus the request that
    /// forced the growth, so a heap near its ceiling grows reluctantly.
    fn grow(&mut self, min_size: usize) {
        if min_size > BLOCK_CEILING as usize {
            die(HeapFault::OversizeRequest {
                requested: min_size,
                ceiling: BLOCK_CEILING as usize,
            });
        }
        let fac = f64::from(floor_log2(self.config.max_footprint));
        let pow = f64::from(floor_log2(self.grown));
        let damp = 2.0 * (1.0 - pow / fac);
        let boosted = (damp * self.grown as f64) as usize;
        let wanted = boosted
            .saturating_add(min_size)
            .min(BLOCK_CEILING as usize)
            + TAG_BYTES;
        if self.grown >= self.config.max_footprint {
            die(HeapFault::FootprintCeiling {
                max_footprint: self.config.max_footprint,
            });
        }
        let span = self.provider.acquire(wanted);
        self.grown += span.len;
        self.journal.record(HeapEvent::Grow {
            requested: wanted,
            granted: span.len,
            reserved: self.provider.bytes_reserved(),
        });
        self.adopt_region(span);
    }

    fn note_block_acquired(&mut self, payload: usize, size: usize) {
        if !self.config.enable_memory_debugger_hooks {
            return;
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.block_acquired(payload, size);
        }
    }

    fn note_block_released(&mut self, payload: usize, size: usize) {
        if !self.config.enable_memory_debugger_hooks {
            return;
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.block_released(payload, size);
        }
    }

    fn note_region(&mut self, span: Span) {
        if !self.config.enable_memory_debugger_hooks {
            return;
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.region_granted(span.addr, span.len);
        }
    }
}

impl Heap for SegregatedHeap {
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
        let user = ptr as usize;
        let header = header_for(user);
        let Some(idx) = self.tag_at(header) else {
            die(HeapFault::HeaderMismatch { addr: header });
        };
        let rec = *self.records.get(idx);
        if !self.config.skip_defensive_checks {
            if rec.addr != header {
                die(HeapFault::HeaderMismatch { addr: header });
            }
            if rec.home != HOME_USED {
                die(HeapFault::ResizeOfFreeBlock { addr: header });
            }
        }
        if new_size == rec.size as usize {
            return Some(grant(user));
        }

        if new_size < rec.size as usize {
            let freed = rec.size - new_size as u32;
            if (freed as usize) < 2 * TAG_BYTES {
                return Some(grant(user));
            }
            let cut = header + TAG_BYTES + new_size;
            let pad = pad_for(cut, TAG_BYTES) as u32;
            if ((freed - pad) as usize) < 2 * TAG_BYTES {
                return Some(grant(user));
            }
            let tail_size = freed - pad - TAG_BYTES as u32;
            let tail_idx = self.create_record(cut + pad as usize, tail_size);
            self.records.get_mut(tail_idx).prev = idx;
            if let Some(after) = self.next_of(tail_idx) {
                self.records.get_mut(after).prev = tail_idx;
            }
            self.records.get_mut(idx).size = new_size as u32 + pad;
            self.in_use -= (freed - pad) as usize;
            if self.config.eager_zero_on_release {
                mem::fill_zero(
                    &self.provider,
                    cut + pad as usize + TAG_BYTES,
                    tail_size as usize,
                );
            }
            self.note_block_released(user, rec.size as usize);
            self.note_block_acquired(user, new_size);
            self.retire(tail_idx);
            return Some(grant(user));
        }

        // Grow in place if the address successor is a free bucket member
        // with enough room.
        if let Some(next) = self.next_of(idx) {
            let next_rec = *self.records.get(next);
            if parked_in_bucket(next_rec.home) {
                if !self.config.skip_defensive_checks {
                    let edge = header + TAG_BYTES + rec.size as usize;
                    if next_rec.addr != edge {
                        die(HeapFault::Discontiguity {
                            left: header,
                            right: next_rec.addr,
                        });
                    }
                }
                let available = u64::from(next_rec.size) + TAG_BYTES as u64;
                let need = (new_size - rec.size as usize) as u64;
                if available >= need {
                    self.take_free(next);
                    self.release_record(next);
                    let post = post_carve(next_rec.addr, available as u32, need as u32);
                    let grown_size = match post {
                        PostCarve::Exact => rec.size + need as u32,
                        PostCarve::Slack { dead } => rec.size + need as u32 + dead,
                        PostCarve::Split { pad, .. } => rec.size + need as u32 + pad,
                    };
                    self.records.get_mut(idx).size = grown_size;
                    let mut spill = NIL;
                    if let PostCarve::Split { pad, size: tail } = post {
                        let tail_idx = self
                            .create_record(next_rec.addr + (need as usize) + pad as usize, tail);
                        self.records.get_mut(tail_idx).prev = idx;
                        spill = tail_idx;
                    }
                    let last = if spill != NIL { spill } else { idx };
                    if let Some(after) = self.next_of(last) {
                        self.records.get_mut(after).prev = last;
                    }
                    self.in_use += (grown_size - rec.size) as usize;
                    if spill != NIL {
                        self.retire(spill);
                    }
                    self.note_block_released(user, rec.size as usize);
                    self.note_block_acquired(user, new_size);
                    return Some(grant(user));
                }
            }
        }

        // Move: fresh block at the stored alignment, payload copied, old
        // block released.
        let fresh = self.allocate(new_size, rec.align as usize);
        let fresh_addr = fresh.as_ptr() as usize;
        let lead = user - (header + TAG_BYTES);
        let have = rec.size as usize - lead;
        mem::copy(&self.provider, user, fresh_addr, new_size.min(have));
        self.release(ptr);
        Some(fresh)
    }

    fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let user = ptr as usize;
        let header = header_for(user);
        let Some(idx) = self.tag_at(header) else {
            die(HeapFault::HeaderMismatch { addr: header });
        };
        let rec = *self.records.get(idx);
        if !self.config.skip_defensive_checks {
            if rec.addr != header {
                die(HeapFault::HeaderMismatch { addr: header });
            }
            if rec.home != HOME_USED {
                die(HeapFault::DoubleRelease { addr: header });
            }
        }
        self.in_use -= rec.size as usize + TAG_BYTES;
        self.records.get_mut(idx).align = 1;
        if self.config.eager_zero_on_release {
            mem::fill_zero(&self.provider, header + TAG_BYTES, rec.size as usize);
        }
        self.note_block_released(header + TAG_BYTES, rec.size as usize);
        self.retire(idx);
    }

    fn bytes_in_use(&self) -> usize {
        self.in_use
    }

    fn bytes_reserved(&self) -> usize {
        self.provider.bytes_reserved() + self.records.bytes_reserved()
    }

    fn block_count(&self) -> usize {
        self.blocks
    }

    fn free_block_count(&self) -> usize {
        let mut count = self.cache.len();
        for bucket in &self.buckets {
            count += bucket.len();
        }
        count
    }
}

impl Default for SegregatedHeap {
    fn default() -> Self {
        Self::new()
    }
}
