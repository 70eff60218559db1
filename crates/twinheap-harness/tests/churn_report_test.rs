//! End-to-end checks of the workload driver and the report shapes.

use twinheap_core::HeapConfig;
use twinheap_harness::{ChurnReport, EngineKind, WorkloadSpec, run_churn, run_compare};

fn short_spec(seed: u64) -> WorkloadSpec {
    WorkloadSpec {
        seed,
        steps: 1_500,
        slots: 24,
        max_size: 2048,
        ..WorkloadSpec::default()
    }
}

#[test]
fn churn_drains_both_engines() {
    for kind in [EngineKind::Segregated, EngineKind::IntervalTree] {
        let mut engine = kind.build(HeapConfig::default());
        let outcome = run_churn(engine.heap(), &short_spec(3));
        engine.audit();
        assert!(
            outcome.allocations > 0,
            "{}: script must allocate",
            kind.label()
        );
        assert_eq!(
            outcome.releases,
            outcome.allocations,
            "{}: every block must come back exactly once",
            kind.label()
        );
        assert_eq!(
            outcome.final_bytes_in_use,
            0,
            "{}: drained script must leave nothing in use",
            kind.label()
        );
        assert!(outcome.peak_bytes_in_use > 0);
        assert!(outcome.peak_bytes_reserved >= outcome.final_bytes_reserved);
    }
}

#[test]
fn identical_seeds_reproduce_identical_outcomes() {
    let spec = short_spec(9);
    let mut first = EngineKind::Segregated.build(HeapConfig::default());
    let mut second = EngineKind::Segregated.build(HeapConfig::default());
    let one = run_churn(first.heap(), &spec);
    let two = run_churn(second.heap(), &spec);
    assert_eq!(one.allocations, two.allocations);
    assert_eq!(one.releases, two.releases);
    assert_eq!(one.resizes, two.resizes);
    assert_eq!(one.relocations, two.relocations);
    assert_eq!(one.peak_bytes_in_use, two.peak_bytes_in_use);
}

#[test]
fn compare_agrees_on_default_config() {
    let outcome =
        run_compare(&short_spec(5), HeapConfig::default()).expect("engines must agree");
    assert!(outcome.checkpoints > 0);
    assert_eq!(outcome.segregated.final_bytes_in_use, 0);
    assert_eq!(outcome.interval_tree.final_bytes_in_use, 0);
    assert_eq!(
        outcome.segregated.allocations,
        outcome.interval_tree.allocations,
        "both engines must see the same script"
    );
}

#[test]
fn compare_agrees_without_the_small_object_cache() {
    let config = HeapConfig::default().without_small_object_cache();
    run_compare(&short_spec(6), config).expect("engines must agree with the cache disabled");
}

#[test]
fn churn_reports_carry_the_growth_journal() {
    let mut engine =
        EngineKind::IntervalTree.build(HeapConfig::default().with_initial_footprint(1 << 13));
    let spec = WorkloadSpec {
        seed: 2,
        steps: 2_000,
        slots: 32,
        max_size: 8192,
        ..WorkloadSpec::default()
    };
    let outcome = run_churn(engine.heap(), &spec);
    let report = ChurnReport {
        engine: "interval-tree",
        spec,
        outcome,
        events: engine.drain_journal(),
    };

    let value = serde_json::to_value(&report).expect("report serializes");
    assert_eq!(value["engine"], "interval-tree");
    let events = value["events"].as_array().expect("events array");
    assert_eq!(events[0]["event"], "preallocate");
    assert!(
        events.iter().any(|event| event["event"] == "grow"),
        "forced growth must be journaled"
    );
}

#[test]
fn unknown_engine_labels_are_rejected() {
    let err = EngineKind::from_label("slab").unwrap_err();
    assert!(err.to_string().contains("unknown engine"));
}

#[test]
fn degenerate_spec_shapes_are_clamped() {
    let mut engine = EngineKind::Segregated.build(HeapConfig::default());
    let spec = WorkloadSpec {
        seed: 0,
        steps: 50,
        slots: 0,
        max_size: 1,
        ..WorkloadSpec::default()
    };
    let outcome = run_churn(engine.heap(), &spec);
    assert_eq!(outcome.final_bytes_in_use, 0);
}
