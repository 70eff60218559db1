//! Bounds-checked raw payload access.
//!
//! The allocator engine above this crate manipulates payload memory in
//! exactly four ways: reading and writing 8-byte block tags on the header
//! rail, zero-filling spans, and moving payload bytes on resize. Each helper
//! takes the owning provider so debug builds can assert the target lies in a
//! live region; release builds skip the walk, which is the documented
//! validation trade-off.

use crate::provider::DefaultProvider;

/// Width of a block tag, and the rail every tag sits on.
pub const TAG_BYTES: usize = 8;

/// Read the tag at `addr`. `addr` must sit on the 8-byte rail inside a live
/// region.
#[must_use]
pub fn read_tag(provider: &DefaultProvider, addr: usize) -> u64 {
    debug_assert!(addr % TAG_BYTES == 0, "tag read off the rail: {addr:#x}");
    debug_assert!(
        provider.owns(addr, TAG_BYTES),
        "tag read outside live regions: {addr:#x}"
    );
    // SAFETY: addr is rail-aligned inside a region this provider mapped
    // read/write; u64 has no invalid bit patterns.
    unsafe { (addr as *const u64).read() }
}

/// Write the tag at `addr`. Same requirements as [`read_tag`].
pub fn write_tag(provider: &DefaultProvider, addr: usize, tag: u64) {
    debug_assert!(addr % TAG_BYTES == 0, "tag write off the rail: {addr:#x}");
    debug_assert!(
        provider.owns(addr, TAG_BYTES),
        "tag write outside live regions: {addr:#x}"
    );
    // SAFETY: addr is rail-aligned inside a region this provider mapped
    // read/write; no reference to this memory exists anywhere.
    unsafe {
        (addr as *mut u64).write(tag);
    }
}

/// Zero-fill `[addr, addr + len)`.
pub fn fill_zero(provider: &DefaultProvider, addr: usize, len: usize) {
    if len == 0 {
        return;
    }
    debug_assert!(
        provider.owns(addr, len),
        "zero fill outside live regions: {addr:#x}+{len}"
    );
    // SAFETY: the span lies inside a region this provider mapped read/write.
    unsafe {
        core::ptr::write_bytes(addr as *mut u8, 0, len);
    }
}

/// Move `len` payload bytes from `src` to `dst`. Overlap is tolerated.
pub fn copy(provider: &DefaultProvider, src: usize, dst: usize, len: usize) {
    if len == 0 {
        return;
    }
    debug_assert!(
        provider.owns(src, len),
        "copy source outside live regions: {src:#x}+{len}"
    );
    debug_assert!(
        provider.owns(dst, len),
        "copy target outside live regions: {dst:#x}+{len}"
    );
    // SAFETY: both spans lie inside regions this provider mapped read/write;
    // ptr::copy handles overlap.
    unsafe {
        core::ptr::copy(src as *const u8, dst as *mut u8, len);
    }
}
