//! Block records, intrusive free lists, and carve geometry for the
//! segregated heap.
//!
//! A block is a tag in heap memory followed by its payload; everything else
//! about it lives in a [`BlockRecord`] slot. Records link into at most one
//! list at a time, either a size bucket or the small-object cache, through
//! their own `link_prev`/`link_next` fields, so membership moves are O(1)
//! and need no auxiliary nodes.

use twinheap_pages::{SlotArena, SlotIndex, NIL};
use twinheap_pages::mem::TAG_BYTES;

/// Number of power-of-two size buckets.
pub(crate) const BUCKET_COUNT: usize = 32;

/// Requests below this many bytes are served from the LIFO cache first.
pub(crate) const CACHE_BLOCK_LIMIT: u32 = 16;

/// The cache drains its oldest member once it holds this many blocks.
pub(crate) const CACHE_DEPTH: usize = 16;

/// Largest payload a single block can describe.
pub(crate) const BLOCK_CEILING: u32 = u32::MAX;

/// `home` value of a block that is handed out or loose mid-operation.
pub(crate) const HOME_USED: u8 = 0xFF;

/// `home` value of a cache member. Cache members are invisible to merging.
pub(crate) const HOME_CACHE: u8 = 0xFE;

/// Whether a `home` value names a bucket. Only bucket members coalesce.
pub(crate) fn parked_in_bucket(home: u8) -> bool {
    (home as usize) < BUCKET_COUNT
}

/// Metadata slot for one block.
///
/// `addr` is the tag address; the payload starts `TAG_BYTES` later. `prev`
/// points at the address-predecessor block so backward coalescing needs no
/// search, and `home` says which list, if any, currently owns the record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockRecord {
    pub addr: usize,
    pub size: u32,
    pub align: u32,
    pub prev: SlotIndex,
    pub link_prev: SlotIndex,
    pub link_next: SlotIndex,
    pub home: u8,
}

impl BlockRecord {
    pub(crate) fn fresh(addr: usize, size: u32) -> Self {
        BlockRecord {
            addr,
            size,
            align: 1,
            prev: NIL,
            link_prev: NIL,
            link_next: NIL,
            home: HOME_USED,
        }
    }
}

/// Doubly linked list threaded through [`BlockRecord`] slots.
///
/// `head` is the oldest member and `tail` the newest; scans start at the
/// tail so recently freed blocks, whose neighborhoods are still warm, are
/// preferred for reuse.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockList {
    head: SlotIndex,
    tail: SlotIndex,
    len: usize,
}

impl BlockList {
    pub(crate) const fn new() -> Self {
        BlockList {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Newest member, where scans begin. `NIL` when empty.
    pub(crate) fn tail(&self) -> SlotIndex {
        self.tail
    }

    pub(crate) fn push(&mut self, nodes: &mut SlotArena<BlockRecord>, idx: SlotIndex) {
        let old_tail = self.tail;
        {
            let rec = nodes.get_mut(idx);
            rec.link_prev = old_tail;
            rec.link_next = NIL;
        }
        if old_tail == NIL {
            self.head = idx;
        } else {
            nodes.get_mut(old_tail).link_next = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, nodes: &mut SlotArena<BlockRecord>, idx: SlotIndex) {
        let (link_prev, link_next) = {
            let rec = nodes.get(idx);
            (rec.link_prev, rec.link_next)
        };
        if link_prev == NIL {
            self.head = link_next;
        } else {
            nodes.get_mut(link_prev).link_next = link_next;
        }
        if link_next == NIL {
            self.tail = link_prev;
        } else {
            nodes.get_mut(link_next).link_prev = link_prev;
        }
        let rec = nodes.get_mut(idx);
        rec.link_prev = NIL;
        rec.link_next = NIL;
        self.len -= 1;
    }

    /// Unlinks and returns the oldest member. Callers check for emptiness.
    pub(crate) fn pop_oldest(&mut self, nodes: &mut SlotArena<BlockRecord>) -> SlotIndex {
        let oldest = self.head;
        debug_assert_ne!(oldest, NIL);
        self.remove(nodes, oldest);
        oldest
    }
}

/// Bytes of padding that carry `addr` up to the next `align` boundary.
pub(crate) fn pad_for(addr: usize, align: usize) -> usize {
    (align - addr % align) % align
}

/// Tag address for a user pointer: back one tag, then down to the tag rail.
pub(crate) fn header_for(user: usize) -> usize {
    let raw = user - TAG_BYTES;
    raw - raw % TAG_BYTES
}

/// Bucket a free block of `size` bytes parks in: floor of log2.
pub(crate) fn bucket_of(size: u32) -> u32 {
    if size == 0 {
        0
    } else {
        31 - size.leading_zeros()
    }
}

/// First bucket whose members are all large enough for `size`: ceiling of
/// log2. Scanning from here instead of the floor bucket skips the bucket
/// where most members are too small.
pub(crate) fn scan_start(size: u32) -> u32 {
    if size <= 1 {
        0
    } else {
        32 - (size - 1).leading_zeros()
    }
}

/// How the front of a candidate block absorbs an alignment requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PreCarve {
    /// The payload is already aligned.
    Aligned,
    /// The misalignment is smaller than a tag; fold it into the block.
    Slack { pad: u32 },
    /// Split: the original block keeps `keep` bytes, a new tag goes at
    /// `keep` past the payload, and `gap` dead bytes sit between that tag
    /// and the aligned payload.
    Fragment { keep: u32, gap: u32 },
}

/// Front-of-block geometry for aligning `payload` to `align`.
pub(crate) fn pre_carve(payload: usize, align: usize) -> PreCarve {
    let pad = pad_for(payload, align);
    if pad == 0 {
        return PreCarve::Aligned;
    }
    if pad < TAG_BYTES {
        return PreCarve::Slack { pad: pad as u32 };
    }
    // A pad of exactly one tag would leave no room for the leading block's
    // payload byte count to stay nonzero alongside the new tag, so step to
    // the next boundary.
    let pad = if pad == TAG_BYTES { pad + TAG_BYTES } else { pad };
    let data = payload + pad;
    let header = {
        let raw = data - TAG_BYTES;
        raw - raw % TAG_BYTES
    };
    PreCarve::Fragment {
        keep: (header - payload) as u32,
        gap: (data - header - TAG_BYTES) as u32,
    }
}

/// How the tail of a block behaves after carving `need` bytes out of `have`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PostCarve {
    /// The fit is exact.
    Exact,
    /// The leftover cannot hold a tag and a payload; fold it into the block.
    Slack { dead: u32 },
    /// Split off a free tail block: its tag goes `pad` bytes past the carved
    /// payload end and it spans `size` bytes.
    Split { pad: u32, size: u32 },
}

/// Tail-of-block geometry for carving `need` bytes at `payload` out of a
/// span of `have` bytes.
pub(crate) fn post_carve(payload: usize, have: u32, need: u32) -> PostCarve {
    let gap = have - need;
    if gap == 0 {
        return PostCarve::Exact;
    }
    if gap as usize <= TAG_BYTES {
        return PostCarve::Slack { dead: gap };
    }
    let pad = pad_for(payload + need as usize, TAG_BYTES) as u32;
    if gap <= pad + TAG_BYTES as u32 {
        return PostCarve::Slack { dead: gap };
    }
    PostCarve::Split {
        pad,
        size: gap - pad - TAG_BYTES as u32,
    }
}

/// Floor of log2 for footprint arithmetic. Callers guarantee `value > 0`.
pub(crate) fn floor_log2(value: usize) -> u32 {
    usize::BITS - 1 - value.leading_zeros()
}
