//! Seeded churn scripts over the shared heap contract.
//!
//! All pressure goes through `&mut dyn Heap`, so the scripts exercise the
//! same object-safe surface an embedding would; the [`Engine`] wrapper
//! keeps the concrete-only surfaces (journal, audit) reachable afterward.

use serde::{Deserialize, Serialize};
use twinheap_core::{Heap, HeapConfig, HeapEvent, SegregatedHeap, TreeHeap};

use crate::report::HarnessError;

/// xorshift64* step. The harness needs repeatable scripts, not entropy.
#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // A zero seed would freeze the generator.
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        debug_assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Shape of one churn script.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub seed: u64,
    pub steps: usize,
    /// Concurrent block slots the script cycles through.
    pub slots: usize,
    /// Largest block the script requests; resizes may ask for half again.
    pub max_size: usize,
    pub max_align_log2: u32,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        WorkloadSpec {
            seed: 1,
            steps: 10_000,
            slots: 64,
            max_size: 4096,
            max_align_log2: 7,
        }
    }
}

/// Which engine a script should drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    Segregated,
    IntervalTree,
}

impl EngineKind {
    pub fn from_label(label: &str) -> Result<Self, HarnessError> {
        match label {
            "segregated" => Ok(EngineKind::Segregated),
            "interval-tree" => Ok(EngineKind::IntervalTree),
            other => Err(HarnessError::UnknownEngine(other.to_string())),
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            EngineKind::Segregated => "segregated",
            EngineKind::IntervalTree => "interval-tree",
        }
    }

    #[must_use]
    pub fn build(self, config: HeapConfig) -> Engine {
        match self {
            EngineKind::Segregated => Engine::Segregated(SegregatedHeap::with_config(config)),
            EngineKind::IntervalTree => Engine::IntervalTree(TreeHeap::with_config(config)),
        }
    }
}

/// A concrete engine behind the shared contract.
pub enum Engine {
    Segregated(SegregatedHeap),
    IntervalTree(TreeHeap),
}

impl Engine {
    pub fn heap(&mut self) -> &mut dyn Heap {
        match self {
            Engine::Segregated(heap) => heap,
            Engine::IntervalTree(heap) => heap,
        }
    }

    pub fn drain_journal(&mut self) -> Vec<HeapEvent> {
        match self {
            Engine::Segregated(heap) => heap.drain_journal(),
            Engine::IntervalTree(heap) => heap.drain_journal(),
        }
    }

    /// Structural self-check; violations abort, as everywhere else.
    pub fn audit(&self) {
        match self {
            Engine::Segregated(heap) => heap.audit(),
            Engine::IntervalTree(heap) => heap.audit(),
        }
    }
}

/// Counters gathered while a script runs.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ChurnOutcome {
    pub allocations: usize,
    pub releases: usize,
    pub resizes: usize,
    /// Resizes that moved the block.
    pub relocations: usize,
    pub peak_bytes_in_use: usize,
    pub peak_bytes_reserved: usize,
    pub final_bytes_in_use: usize,
    pub final_bytes_reserved: usize,
    pub final_block_count: usize,
}

/// Runs one seeded script against a single engine. The script drains every
/// surviving block at the end, so a nonzero final byte count is an engine
/// defect, not workload residue.
pub fn run_churn(heap: &mut dyn Heap, spec: &WorkloadSpec) -> ChurnOutcome {
    let slots = spec.slots.max(1);
    let mut rng = XorShift64::new(spec.seed);
    let mut ptrs = vec![std::ptr::null_mut::<u8>(); slots];
    let mut live = vec![false; slots];
    let mut outcome = ChurnOutcome::default();

    for _ in 0..spec.steps {
        let op = rng.gen_range_usize(0, 99);
        let idx = rng.gen_range_usize(0, slots - 1);
        match op {
            // allocate (biased)
            0..=44 => {
                if live[idx] {
                    continue;
                }
                let size = rng.gen_range_usize(1, spec.max_size.max(1));
                let align = 1 << rng.gen_range_usize(0, spec.max_align_log2 as usize);
                ptrs[idx] = heap.allocate(size, align).as_ptr();
                live[idx] = true;
                outcome.allocations += 1;
            }
            // release
            45..=69 => {
                if !live[idx] {
                    continue;
                }
                heap.release(ptrs[idx]);
                live[idx] = false;
                outcome.releases += 1;
            }
            // resize, possibly moving the block
            70..=89 => {
                if !live[idx] {
                    continue;
                }
                let new_size =
                    rng.gen_range_usize(1, spec.max_size.max(1) + spec.max_size / 2);
                if let Some(moved) = heap.resize(ptrs[idx], new_size) {
                    if moved.as_ptr() != ptrs[idx] {
                        outcome.relocations += 1;
                    }
                    ptrs[idx] = moved.as_ptr();
                    outcome.resizes += 1;
                }
            }
            // resize-to-zero is the contract's second release path
            _ => {
                if !live[idx] {
                    continue;
                }
                if heap.resize(ptrs[idx], 0).is_none() {
                    live[idx] = false;
                    outcome.releases += 1;
                }
            }
        }
        outcome.peak_bytes_in_use = outcome.peak_bytes_in_use.max(heap.bytes_in_use());
        outcome.peak_bytes_reserved = outcome.peak_bytes_reserved.max(heap.bytes_reserved());
    }

    for idx in 0..slots {
        if live[idx] {
            heap.release(ptrs[idx]);
            live[idx] = false;
            outcome.releases += 1;
        }
    }
    outcome.final_bytes_in_use = heap.bytes_in_use();
    outcome.final_bytes_reserved = heap.bytes_reserved();
    outcome.final_block_count = heap.block_count();
    outcome
}

/// Result of a pairwise run; producing one at all means every checkpoint
/// agreed.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CompareOutcome {
    pub segregated: ChurnOutcome,
    pub interval_tree: ChurnOutcome,
    pub checkpoints: usize,
}

/// One tag plus bounded carve slack per block; anything past this is an
/// accounting leak in the segregated engine.
const SEG_OVERHEAD_CEILING: usize = 32;

/// Runs one script against both engines and cross-checks the rest-point
/// invariants the pair must agree on: the tree heap accounts exactly the
/// requested bytes, the segregated heap stays within its per-block
/// overhead, and both report the same used-block census as the script's
/// own shadow state.
pub fn run_compare(
    spec: &WorkloadSpec,
    config: HeapConfig,
) -> Result<CompareOutcome, HarnessError> {
    let slots = spec.slots.max(1);
    let mut seg = SegregatedHeap::with_config(config);
    let mut tree = TreeHeap::with_config(config);
    let mut rng = XorShift64::new(spec.seed);

    let mut seg_ptrs = vec![std::ptr::null_mut::<u8>(); slots];
    let mut tree_ptrs = vec![std::ptr::null_mut::<u8>(); slots];
    let mut sizes = vec![0usize; slots];
    let mut live = vec![false; slots];

    let mut seg_out = ChurnOutcome::default();
    let mut tree_out = ChurnOutcome::default();
    let mut checkpoints = 0usize;

    for step in 0..spec.steps {
        let op = rng.gen_range_usize(0, 99);
        let idx = rng.gen_range_usize(0, slots - 1);
        match op {
            0..=44 => {
                if live[idx] {
                    continue;
                }
                let size = rng.gen_range_usize(1, spec.max_size.max(1));
                let align = 1 << rng.gen_range_usize(0, spec.max_align_log2 as usize);
                let s = seg.allocate(size, align);
                let t = tree.allocate(size, align);
                if s.as_ptr() as usize % align != 0 || t.as_ptr() as usize % align != 0 {
                    return Err(HarnessError::Disagreement(format!(
                        "step={step}: a block ignored its {align}-byte alignment"
                    )));
                }
                seg_ptrs[idx] = s.as_ptr();
                tree_ptrs[idx] = t.as_ptr();
                sizes[idx] = size;
                live[idx] = true;
                seg_out.allocations += 1;
                tree_out.allocations += 1;
            }
            45..=69 => {
                if !live[idx] {
                    continue;
                }
                seg.release(seg_ptrs[idx]);
                tree.release(tree_ptrs[idx]);
                live[idx] = false;
                seg_out.releases += 1;
                tree_out.releases += 1;
            }
            70..=89 => {
                if !live[idx] {
                    continue;
                }
                let new_size =
                    rng.gen_range_usize(1, spec.max_size.max(1) + spec.max_size / 2);
                if let Some(moved) = seg.resize(seg_ptrs[idx], new_size) {
                    if moved.as_ptr() != seg_ptrs[idx] {
                        seg_out.relocations += 1;
                    }
                    seg_ptrs[idx] = moved.as_ptr();
                    seg_out.resizes += 1;
                }
                if let Some(moved) = tree.resize(tree_ptrs[idx], new_size) {
                    if moved.as_ptr() != tree_ptrs[idx] {
                        tree_out.relocations += 1;
                    }
                    tree_ptrs[idx] = moved.as_ptr();
                    tree_out.resizes += 1;
                }
                sizes[idx] = new_size;
            }
            _ => {
                if !live[idx] {
                    continue;
                }
                let _ = seg.resize(seg_ptrs[idx], 0);
                let _ = tree.resize(tree_ptrs[idx], 0);
                live[idx] = false;
                seg_out.releases += 1;
                tree_out.releases += 1;
            }
        }

        seg_out.peak_bytes_in_use = seg_out.peak_bytes_in_use.max(seg.bytes_in_use());
        seg_out.peak_bytes_reserved = seg_out.peak_bytes_reserved.max(seg.bytes_reserved());
        tree_out.peak_bytes_in_use = tree_out.peak_bytes_in_use.max(tree.bytes_in_use());
        tree_out.peak_bytes_reserved =
            tree_out.peak_bytes_reserved.max(tree.bytes_reserved());

        if step % 256 == 0 {
            agree(step, &seg, &tree, &sizes, &live)?;
            checkpoints += 1;
        }
    }

    for idx in 0..slots {
        if live[idx] {
            seg.release(seg_ptrs[idx]);
            tree.release(tree_ptrs[idx]);
            live[idx] = false;
            seg_out.releases += 1;
            tree_out.releases += 1;
        }
    }
    agree(spec.steps, &seg, &tree, &sizes, &live)?;
    checkpoints += 1;

    if seg.bytes_in_use() != 0 || tree.bytes_in_use() != 0 {
        return Err(HarnessError::Disagreement(format!(
            "drained script left bytes in use (segregated={}, interval-tree={})",
            seg.bytes_in_use(),
            tree.bytes_in_use()
        )));
    }
    seg.audit();
    tree.audit();

    seg_out.final_bytes_in_use = seg.bytes_in_use();
    seg_out.final_bytes_reserved = seg.bytes_reserved();
    seg_out.final_block_count = seg.block_count();
    tree_out.final_bytes_in_use = tree.bytes_in_use();
    tree_out.final_bytes_reserved = tree.bytes_reserved();
    tree_out.final_block_count = tree.block_count();

    Ok(CompareOutcome {
        segregated: seg_out,
        interval_tree: tree_out,
        checkpoints,
    })
}

fn agree(
    step: usize,
    seg: &SegregatedHeap,
    tree: &TreeHeap,
    sizes: &[usize],
    live: &[bool],
) -> Result<(), HarnessError> {
    let live_count = live.iter().filter(|&&l| l).count();
    let live_bytes: usize = live
        .iter()
        .zip(sizes)
        .filter_map(|(&l, &size)| l.then_some(size))
        .sum();

    if tree.bytes_in_use() != live_bytes {
        return Err(HarnessError::Disagreement(format!(
            "step={step}: interval-tree accounts {} bytes for {live_bytes} requested",
            tree.bytes_in_use()
        )));
    }
    if seg.bytes_in_use() < live_bytes + 8 * live_count
        || seg.bytes_in_use() > live_bytes + SEG_OVERHEAD_CEILING * live_count
    {
        return Err(HarnessError::Disagreement(format!(
            "step={step}: segregated accounts {} bytes for {live_bytes} requested \
             across {live_count} blocks",
            seg.bytes_in_use()
        )));
    }
    if seg.block_count() - seg.free_block_count() != live_count {
        return Err(HarnessError::Disagreement(format!(
            "step={step}: segregated reports {} used blocks, script holds {live_count}",
            seg.block_count() - seg.free_block_count()
        )));
    }
    if tree.block_count() - tree.free_block_count() != live_count {
        return Err(HarnessError::Disagreement(format!(
            "step={step}: interval-tree reports {} used blocks, script holds {live_count}",
            tree.block_count() - tree.free_block_count()
        )));
    }
    Ok(())
}
