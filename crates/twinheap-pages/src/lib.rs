//! # twinheap-pages
//!
//! The thin raw-memory layer of the twinheap workspace: OS page acquisition,
//! the fixed-size metadata slot arena, and bounds-checked payload access
//! helpers. Every `unsafe` block in the workspace lives in this crate; the
//! engine crate above it denies `unsafe` and works purely in slot indices
//! and integer addresses.

#![allow(unsafe_code)]

pub mod arena;
pub mod fault;
pub mod mem;
pub mod provider;

pub use arena::{NIL, SlotArena, SlotIndex};
pub use fault::{FaultClass, HeapFault, die};
pub use provider::{DefaultProvider, Span};
