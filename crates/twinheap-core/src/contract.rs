//! The allocation contract both heap engines fulfil.
//!
//! The trait is object safe on purpose: the harness and the differential
//! tests drive either engine through `Box<dyn Heap>` without caring which one
//! is behind the pointer. Every method that cannot honor its contract dies
//! through `twinheap_pages::die` instead of returning an error; a heap that
//! has lost track of its own blocks has nothing useful left to return.

use std::ptr::NonNull;

use twinheap_pages::{die, HeapFault};

/// A growable heap handing out aligned blocks.
pub trait Heap {
    /// Returns a pointer to `size` usable bytes aligned to `align`.
    ///
    /// `align` must be a power of two. Dies on a zero-size request, on a
    /// request above the configured footprint ceiling, and when the OS
    /// refuses the growth needed to satisfy the request.
    fn allocate(&mut self, size: usize, align: usize) -> NonNull<u8>;

    /// Resizes the block behind `ptr` to `new_size` bytes, in place when the
    /// neighborhood allows it and by move-and-copy otherwise.
    ///
    /// A `new_size` of zero releases the block, and a null `ptr` is a no-op;
    /// both return `None`. Every other call returns the block's possibly new
    /// address. An engine may leave a shrinking block alone when the spare
    /// tail would be too small to stand on its own.
    fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>>;

    /// Returns the block behind `ptr` to the heap. Null is a no-op.
    fn release(&mut self, ptr: *mut u8);

    /// Bytes accounted to live blocks. Each engine documents whether its
    /// per-block overhead is part of the figure.
    fn bytes_in_use(&self) -> usize;

    /// Bytes reserved from the OS for payloads and metadata combined.
    fn bytes_reserved(&self) -> usize;

    /// Number of blocks the heap is tracking, used and free.
    fn block_count(&self) -> usize;

    /// Number of blocks currently available to allocation.
    fn free_block_count(&self) -> usize;
}

/// Observer for block and region lifecycle events.
///
/// Installed hooks fire only when the heap's configuration enables them, so
/// an uninstrumented heap pays a single branch per event. All addresses are
/// payload addresses, not tag addresses.
pub trait DebugHooks {
    fn block_acquired(&mut self, _addr: usize, _size: usize) {}
    fn block_released(&mut self, _addr: usize, _size: usize) {}
    fn region_granted(&mut self, _addr: usize, _len: usize) {}
}

/// Wraps a payload address the heap is about to hand out.
///
/// Providers never grant address zero, so the `None` arm is unreachable on a
/// healthy heap and is classed as corruption if it ever fires.
pub(crate) fn grant(addr: usize) -> NonNull<u8> {
    match NonNull::new(addr as *mut u8) {
        Some(ptr) => ptr,
        None => die(HeapFault::HeaderMismatch { addr }),
    }
}
