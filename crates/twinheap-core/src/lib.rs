//! Heap allocator engines.
//!
//! Two allocators share one contract and one metadata substrate:
//!
//! * [`SegregatedHeap`] keeps free blocks in 32 power-of-two buckets with a
//!   small LIFO cache in front, and threads an 8-byte tag before every
//!   payload so a user pointer can be walked back to its record.
//! * [`TreeHeap`] keeps every block, used or free, as an entry of an
//!   order-statistic [`RangeMap`] keyed by address, and answers fit queries
//!   from the tree's cached subtree windows.
//!
//! Both implement [`Heap`], take the same [`HeapConfig`] record, and report
//! faults through `twinheap_pages::die`. Callers pick one per workload; the
//! harness crate drives either through the trait.

#![deny(unsafe_code)]

pub mod config;
pub mod contract;
pub mod journal;
pub mod rangemap;
pub mod segregated;
pub mod treealloc;

mod block;

pub use config::HeapConfig;
pub use contract::{DebugHooks, Heap};
pub use journal::{EventJournal, HeapEvent};
pub use rangemap::{Entry, RangeMap};
pub use segregated::SegregatedHeap;
pub use treealloc::{BlockSpan, TreeHeap};
