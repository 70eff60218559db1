//! JSON report shapes for harness runs.

use std::io;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use twinheap_core::HeapEvent;

use crate::workload::{ChurnOutcome, CompareOutcome, WorkloadSpec};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unknown engine '{0}' (expected 'segregated' or 'interval-tree')")]
    UnknownEngine(String),
    #[error("engines disagree: {0}")]
    Disagreement(String),
    #[error("report io: {0}")]
    Io(#[from] io::Error),
    #[error("report encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Single-engine churn summary with the engine's growth journal attached.
#[derive(Debug, Serialize)]
pub struct ChurnReport {
    pub engine: &'static str,
    pub spec: WorkloadSpec,
    pub outcome: ChurnOutcome,
    pub events: Vec<HeapEvent>,
}

/// Pairwise run summary.
#[derive(Debug, Serialize)]
pub struct CompareReport {
    pub spec: WorkloadSpec,
    pub outcome: CompareOutcome,
}

/// Serializes `report` as pretty JSON to `output`, or stdout when omitted.
pub fn emit<T: Serialize>(report: &T, output: Option<&Path>) -> Result<(), HarnessError> {
    let text = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => std::fs::write(path, format!("{text}\n"))?,
        None => println!("{text}"),
    }
    Ok(())
}
