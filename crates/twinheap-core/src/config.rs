//! Runtime configuration shared by both heap engines.
//!
//! Every knob that used to be a build-time switch in earlier revisions is a
//! field here, so one binary can host differently tuned heaps side by side.
//! Allocator constructors validate the record once; a nonsensical combination
//! is a configuration fault, not a recoverable error.

use serde::Serialize;
use twinheap_pages::{die, HeapFault};

/// Bytes reserved by `new()` before the first allocation. 1 MiB.
pub const DEFAULT_INITIAL_FOOTPRINT: usize = 1 << 20;

/// Hard ceiling on total heap growth. 1 TiB.
pub const DEFAULT_MAX_FOOTPRINT: usize = 1 << 40;

/// Slab granularity of the metadata arenas. 1 MiB.
pub const DEFAULT_ARENA_SLAB_BYTES: usize = 1 << 20;

/// Tuning record for a heap instance.
///
/// The boolean flags default to the checked, conservative behavior; flipping
/// them trades safety or determinism for speed, and the caller owns the
/// consequences.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct HeapConfig {
    /// Bytes to reserve up front, before the first allocation request.
    pub initial_footprint: usize,
    /// Total growth ceiling. A heap that needs more memory than this dies
    /// with a configuration fault instead of growing further.
    pub max_footprint: usize,
    /// Slab size used by the slot arenas that hold block metadata.
    pub arena_slab_bytes: usize,
    /// Skip request validation and structural cross-checks on the hot paths.
    /// A permissive heap trusts its callers completely.
    pub skip_defensive_checks: bool,
    /// Bypass the small-object LIFO cache in the segregated heap. Has no
    /// effect on the tree heap, which has no such cache.
    pub skip_small_object_cache: bool,
    /// Invoke installed [`DebugHooks`](crate::DebugHooks) on block and
    /// region lifecycle events.
    pub enable_memory_debugger_hooks: bool,
    /// Zero-fill every freed payload before it re-enters the free structures.
    pub eager_zero_on_release: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            initial_footprint: DEFAULT_INITIAL_FOOTPRINT,
            max_footprint: DEFAULT_MAX_FOOTPRINT,
            arena_slab_bytes: DEFAULT_ARENA_SLAB_BYTES,
            skip_defensive_checks: false,
            skip_small_object_cache: false,
            enable_memory_debugger_hooks: false,
            eager_zero_on_release: false,
        }
    }
}

impl HeapConfig {
    #[must_use]
    pub const fn with_initial_footprint(mut self, bytes: usize) -> Self {
        self.initial_footprint = bytes;
        self
    }

    #[must_use]
    pub const fn with_max_footprint(mut self, bytes: usize) -> Self {
        self.max_footprint = bytes;
        self
    }

    #[must_use]
    pub const fn with_arena_slab_bytes(mut self, bytes: usize) -> Self {
        self.arena_slab_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn permissive(mut self) -> Self {
        self.skip_defensive_checks = true;
        self
    }

    #[must_use]
    pub const fn without_small_object_cache(mut self) -> Self {
        self.skip_small_object_cache = true;
        self
    }

    #[must_use]
    pub const fn with_debugger_hooks(mut self) -> Self {
        self.enable_memory_debugger_hooks = true;
        self
    }

    #[must_use]
    pub const fn with_eager_zeroing(mut self) -> Self {
        self.eager_zero_on_release = true;
        self
    }

    /// Dies with a configuration fault if the record cannot describe a
    /// working heap. Constructors call this before touching the OS.
    pub(crate) fn validate(&self) {
        if self.initial_footprint == 0 || self.arena_slab_bytes == 0 {
            die(HeapFault::ZeroSizeRequest);
        }
        if self.initial_footprint > self.max_footprint {
            die(HeapFault::FootprintOrder {
                initial: self.initial_footprint,
                max: self.max_footprint,
            });
        }
    }
}
