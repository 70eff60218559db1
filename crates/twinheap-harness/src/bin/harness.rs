//! CLI entrypoint for the twinheap workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use twinheap_core::HeapConfig;
use twinheap_harness::{
    ChurnReport, CompareReport, EngineKind, WorkloadSpec, emit, run_churn, run_compare,
};

/// Workload tooling for the twinheap engines.
#[derive(Debug, Parser)]
#[command(name = "twinheap-harness")]
#[command(about = "Deterministic workload harness for the twinheap engines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded churn script against one engine.
    Churn {
        /// Engine to drive ("segregated" or "interval-tree").
        #[arg(long, default_value = "segregated")]
        engine: String,
        /// Script seed.
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Number of script steps.
        #[arg(long, default_value_t = 10_000)]
        steps: usize,
        /// Concurrent block slots the script cycles through.
        #[arg(long, default_value_t = 64)]
        slots: usize,
        /// Largest block the script requests.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run one script against both engines and cross-check the pair.
    Compare {
        /// Script seed.
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Number of script steps.
        #[arg(long, default_value_t = 10_000)]
        steps: usize,
        /// Concurrent block slots the script cycles through.
        #[arg(long, default_value_t = 64)]
        slots: usize,
        /// Largest block the script requests.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Churn {
            engine,
            seed,
            steps,
            slots,
            max_size,
            output,
        } => {
            let kind = EngineKind::from_label(&engine)?;
            let spec = WorkloadSpec {
                seed,
                steps,
                slots,
                max_size,
                ..WorkloadSpec::default()
            };
            let mut engine = kind.build(HeapConfig::default());
            let outcome = run_churn(engine.heap(), &spec);
            engine.audit();
            let report = ChurnReport {
                engine: kind.label(),
                spec,
                outcome,
                events: engine.drain_journal(),
            };
            emit(&report, output.as_deref())?;
        }
        Command::Compare {
            seed,
            steps,
            slots,
            max_size,
            output,
        } => {
            let spec = WorkloadSpec {
                seed,
                steps,
                slots,
                max_size,
                ..WorkloadSpec::default()
            };
            let outcome = run_compare(&spec, HeapConfig::default())?;
            let report = CompareReport { spec, outcome };
            emit(&report, output.as_deref())?;
        }
    }
    Ok(())
}
