//! Workload harness for the twinheap engines.
//!
//! This crate provides:
//! - Deterministic churn scripts: seeded allocate/resize/release pressure
//!   driven through the shared [`Heap`](twinheap_core::Heap) contract.
//! - Pairwise comparison: one script against both engines with every
//!   rest-point invariant cross-checked.
//! - Report generation: machine-readable JSON summaries with the engines'
//!   growth journals attached.

#![forbid(unsafe_code)]

pub mod report;
pub mod workload;

pub use report::{ChurnReport, CompareReport, HarnessError, emit};
pub use workload::{
    ChurnOutcome, CompareOutcome, Engine, EngineKind, WorkloadSpec, run_churn, run_compare,
};
