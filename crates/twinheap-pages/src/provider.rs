//! OS-level memory acquisition.
//!
//! Two providers share one surface: [`PageProvider`] maps zero-filled
//! anonymous pages directly from the kernel and is the default on unix
//! platforms; [`SlabProvider`] is the coarse fallback over the process
//! allocator for everything else. Both track their regions for a final
//! teardown and keep a running reserved-bytes counter.
//!
//! The fallback is deliberately the simpler design: exact-size regions, no
//! page granularity, no large-page advice, and an O(n) scan on release. The
//! asymmetry with the page path is intentional and should stay.
//!
//! A provider never retries: if the OS refuses a request, the process is
//! already past saving for an allocator that owns the heap, and [`die`]
//! fires with [`HeapFault::OsRefused`].

use crate::fault::{HeapFault, die};

/// Span of raw memory granted by a provider. `len` may exceed the requested
/// minimum (page rounding); the whole span belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub addr: usize,
    pub len: usize,
}

/// The provider engine code compiles against on this platform.
#[cfg(unix)]
pub type DefaultProvider = PageProvider;
/// The provider engine code compiles against on this platform.
#[cfg(not(unix))]
pub type DefaultProvider = SlabProvider;

/// Spans at or above this size get large-page advice.
#[cfg(all(unix, target_os = "linux"))]
const HUGE_SPAN_BYTES: usize = 2 * 1024 * 1024;
#[cfg(unix)]
const FALLBACK_PAGE_BYTES: usize = 4096;

/// Bookkeeping node for one granted region. Nodes are self-hosted: they live
/// in dedicated pages mapped by the provider itself, never in the process
/// heap, so the provider cannot recurse into any allocator it backs.
#[cfg(unix)]
struct RegionNode {
    /// Region address, or 0 once released.
    data: usize,
    /// Region length, or 0 once released.
    len: usize,
    /// Chain predecessor (older node), null at the end.
    prev: *mut RegionNode,
    /// Address of the node page this node opened, or 0. Set only on the
    /// first node placed in each node page; teardown unmaps these.
    origin: usize,
}

/// Page-granular provider over `mmap`.
///
/// Regions are rounded up to the OS page size, mapped zero-filled and
/// private, and advised `MADV_WILLNEED` (plus `MADV_HUGEPAGE` for spans of
/// 2 MiB and up). Releasing an address the provider never granted is a
/// documented no-op.
#[cfg(unix)]
pub struct PageProvider {
    page_size: usize,
    head: *mut RegionNode,
    node_cursor: *mut RegionNode,
    node_slots_left: usize,
    pending_origin: usize,
    reserved: usize,
}

#[cfg(unix)]
impl PageProvider {
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: sysconf reads a static limit and touches no memory of ours.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if raw > 0 {
            raw as usize
        } else {
            FALLBACK_PAGE_BYTES
        };
        Self {
            page_size,
            head: core::ptr::null_mut(),
            node_cursor: core::ptr::null_mut(),
            node_slots_left: 0,
            pending_origin: 0,
            reserved: 0,
        }
    }

    /// OS page size this provider rounds to.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Map a zero-filled span of at least `min_len` bytes. Fatal if the OS
    /// refuses; there is no retry policy.
    pub fn acquire(&mut self, min_len: usize) -> Span {
        debug_assert!(min_len > 0, "zero-length region request");
        let Some(rounded) = min_len.checked_add(self.page_size - 1) else {
            die(HeapFault::OsRefused { bytes: min_len });
        };
        let len = rounded & !(self.page_size - 1);
        let addr = self.map_span(len);
        let node = self.next_node();
        // SAFETY: next_node returned a slot inside a live node page.
        unsafe {
            node.write(RegionNode {
                data: addr,
                len,
                prev: self.head,
                origin: core::mem::take(&mut self.pending_origin),
            });
        }
        self.head = node;
        self.reserved += len;
        Span { addr, len }
    }

    /// Unmap a previously granted region. Unknown addresses fall through
    /// untouched; the gap is documented, not validated.
    pub fn release(&mut self, addr: usize) {
        let mut node = self.head;
        while !node.is_null() {
            // SAFETY: chain nodes live in node pages this provider still owns.
            let n = unsafe { &mut *node };
            if n.data == addr && n.len != 0 {
                unmap(n.data, n.len);
                self.reserved -= n.len;
                n.data = 0;
                n.len = 0;
                return;
            }
            node = n.prev;
        }
    }

    /// Whether `[addr, addr + len)` lies inside one live region.
    #[must_use]
    pub fn owns(&self, addr: usize, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut node = self.head;
        while !node.is_null() {
            // SAFETY: chain nodes live in node pages this provider still owns.
            let n = unsafe { &*node };
            if n.len != 0 && addr >= n.data && end <= n.data + n.len {
                return true;
            }
            node = n.prev;
        }
        false
    }

    /// Total bytes of live regions, node pages excluded.
    #[must_use]
    pub fn bytes_reserved(&self) -> usize {
        self.reserved
    }

    /// Unmap every region and every node page. The provider is reusable
    /// afterwards; calling this twice is a no-op.
    pub fn teardown(&mut self) {
        let mut node = self.head;
        while !node.is_null() {
            // SAFETY: the node is read out in full before anything it lives
            // in can be unmapped; `origin` pages only ever host nodes placed
            // after this one in the chain, so the remaining walk stays in
            // older, still-mapped pages.
            let n = unsafe { node.read() };
            if n.len != 0 {
                unmap(n.data, n.len);
            }
            if n.origin != 0 {
                unmap(n.origin, self.page_size);
            }
            node = n.prev;
        }
        self.head = core::ptr::null_mut();
        self.node_cursor = core::ptr::null_mut();
        self.node_slots_left = 0;
        self.pending_origin = 0;
        self.reserved = 0;
    }

    fn map_span(&self, len: usize) -> usize {
        // SAFETY: anonymous private mapping, no fd, offset 0.
        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            die(HeapFault::OsRefused { bytes: len });
        }
        // SAFETY: raw names a mapping we just received. Advice only; failure
        // is not actionable.
        unsafe {
            libc::madvise(raw, len, libc::MADV_WILLNEED);
            #[cfg(target_os = "linux")]
            if len >= HUGE_SPAN_BYTES {
                libc::madvise(raw, len, libc::MADV_HUGEPAGE);
            }
        }
        raw as usize
    }

    fn next_node(&mut self) -> *mut RegionNode {
        if self.node_slots_left == 0 {
            let page = self.map_span(self.page_size);
            self.node_cursor = page as *mut RegionNode;
            self.node_slots_left = self.page_size / core::mem::size_of::<RegionNode>();
            self.pending_origin = page;
        }
        let node = self.node_cursor;
        // SAFETY: node_slots_left > 0, so the advanced cursor stays within
        // the node page (one past the final slot at most).
        self.node_cursor = unsafe { node.add(1) };
        self.node_slots_left -= 1;
        node
    }
}

#[cfg(unix)]
impl Default for PageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl Drop for PageProvider {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(unix)]
fn unmap(addr: usize, len: usize) {
    // SAFETY: addr/len name a mapping this provider created and still owns.
    // munmap cannot fail for a valid owned mapping; the result is ignored
    // exactly because there is nothing to do with it mid-teardown.
    unsafe {
        libc::munmap(addr as *mut libc::c_void, len);
    }
}

/// Alignment handed to the process allocator for fallback regions. Covers
/// the 8-byte header rail with room to spare.
const SLAB_ALIGN: usize = 16;

struct SlabRegion {
    addr: usize,
    len: usize,
}

/// Coarse fallback provider over the process allocator.
///
/// Same four operations as [`PageProvider`] with weaker guarantees: regions
/// are exact-size (no page rounding), there is no kernel advice, and release
/// scans the region list linearly.
pub struct SlabProvider {
    regions: Vec<SlabRegion>,
    reserved: usize,
}

impl SlabProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            reserved: 0,
        }
    }

    /// Allocate a zero-filled region of exactly `min_len` bytes. Fatal if
    /// the process allocator refuses.
    pub fn acquire(&mut self, min_len: usize) -> Span {
        debug_assert!(min_len > 0, "zero-length region request");
        let Ok(layout) = std::alloc::Layout::from_size_align(min_len, SLAB_ALIGN) else {
            die(HeapFault::OsRefused { bytes: min_len });
        };
        // SAFETY: layout has nonzero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        if raw.is_null() {
            die(HeapFault::OsRefused { bytes: min_len });
        }
        let addr = raw as usize;
        self.regions.push(SlabRegion { addr, len: min_len });
        self.reserved += min_len;
        Span { addr, len: min_len }
    }

    /// Return a region to the process allocator. Unknown addresses are a
    /// no-op, matching the page path.
    pub fn release(&mut self, addr: usize) {
        let Some(pos) = self.regions.iter().position(|r| r.addr == addr) else {
            return;
        };
        let region = self.regions.swap_remove(pos);
        self.reserved -= region.len;
        dealloc_region(&region);
    }

    /// Whether `[addr, addr + len)` lies inside one live region.
    #[must_use]
    pub fn owns(&self, addr: usize, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        self.regions
            .iter()
            .any(|r| addr >= r.addr && end <= r.addr + r.len)
    }

    /// Total bytes of live regions.
    #[must_use]
    pub fn bytes_reserved(&self) -> usize {
        self.reserved
    }

    /// Free every region. The provider is reusable afterwards.
    pub fn teardown(&mut self) {
        for region in self.regions.drain(..) {
            dealloc_region(&region);
        }
        self.reserved = 0;
    }
}

impl Default for SlabProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SlabProvider {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn dealloc_region(region: &SlabRegion) {
    let Ok(layout) = std::alloc::Layout::from_size_align(region.len, SLAB_ALIGN) else {
        return;
    };
    // SAFETY: the region was allocated with exactly this layout in acquire.
    unsafe {
        std::alloc::dealloc(region.addr as *mut u8, layout);
    }
}
