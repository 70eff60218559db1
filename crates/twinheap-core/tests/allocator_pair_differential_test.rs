//! Drives both heap engines through one deterministic churn script and
//! checks every rest-point invariant the pair must uphold. The engines
//! carve differently, so byte accounting is held to each engine's own
//! contract instead of cross-compared: the tree heap reports exactly the
//! requested bytes, the segregated heap adds one tag per block plus a
//! bounded amount of carve slack.

use twinheap_core::{Heap, HeapConfig, SegregatedHeap, TreeHeap};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Live,
}

const SEEDS: [u64; 4] = [1, 2, 3, 4];
const STEPS: usize = 2_000;
const SLOTS: usize = 32;

/// One tag plus bounded carve slack; anything past this is an accounting
/// leak in the segregated engine.
const SEG_OVERHEAD_CEILING: usize = 32;

struct Shadow {
    seg_ptrs: [*mut u8; SLOTS],
    tree_ptrs: [*mut u8; SLOTS],
    sizes: [usize; SLOTS],
    aligns: [usize; SLOTS],
    states: [SlotState; SLOTS],
}

impl Shadow {
    fn new() -> Self {
        Shadow {
            seg_ptrs: [std::ptr::null_mut(); SLOTS],
            tree_ptrs: [std::ptr::null_mut(); SLOTS],
            sizes: [0; SLOTS],
            aligns: [1; SLOTS],
            states: [SlotState::Empty; SLOTS],
        }
    }

    fn live(&self) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        for idx in 0..SLOTS {
            if self.states[idx] == SlotState::Live {
                count += 1;
                bytes += self.sizes[idx];
            }
        }
        (count, bytes)
    }

    fn live_spans(&self, ptrs: &[*mut u8; SLOTS]) -> Vec<(usize, usize)> {
        (0..SLOTS)
            .filter(|&idx| self.states[idx] == SlotState::Live)
            .map(|idx| (ptrs[idx] as usize, self.sizes[idx]))
            .collect()
    }
}

fn assert_disjoint(engine: &str, seed: u64, step: usize, mut spans: Vec<(usize, usize)>) {
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "seed={seed} step={step}: {engine} handed out overlapping blocks \
             ({:#x}+{} vs {:#x})",
            pair[0].0,
            pair[0].1,
            pair[1].0
        );
    }
}

fn checkpoint(
    seed: u64,
    step: usize,
    seg: &SegregatedHeap,
    tree: &TreeHeap,
    shadow: &Shadow,
) {
    let (live, live_bytes) = shadow.live();

    assert_eq!(
        tree.bytes_in_use(),
        live_bytes,
        "seed={seed} step={step}: tree heap must account exactly the requested bytes"
    );
    assert!(
        seg.bytes_in_use() >= live_bytes + 8 * live,
        "seed={seed} step={step}: segregated heap under-counts its tags"
    );
    assert!(
        seg.bytes_in_use() <= live_bytes + SEG_OVERHEAD_CEILING * live,
        "seed={seed} step={step}: segregated heap leaks accounting \
         (in_use={} live_bytes={live_bytes} live={live})",
        seg.bytes_in_use()
    );

    assert_eq!(
        seg.block_count() - seg.free_block_count(),
        live,
        "seed={seed} step={step}: segregated used-block census must match the shadow"
    );
    assert_eq!(
        tree.block_count() - tree.free_block_count(),
        live,
        "seed={seed} step={step}: tree used-block census must match the shadow"
    );

    assert_disjoint("segregated", seed, step, shadow.live_spans(&shadow.seg_ptrs));
    assert_disjoint("interval-tree", seed, step, shadow.live_spans(&shadow.tree_ptrs));

    seg.audit();
    tree.audit();
}

#[test]
fn deterministic_churn_holds_pairwise_invariants() {
    for seed in SEEDS {
        let mut seg = SegregatedHeap::with_config(HeapConfig::default());
        let mut tree = TreeHeap::with_config(HeapConfig::default());
        let mut rng = XorShift64::new(seed);
        let mut shadow = Shadow::new();

        for step in 0..STEPS {
            let op = rng.gen_range_usize(0, 99);
            let idx = rng.gen_range_usize(0, SLOTS - 1);

            match op {
                // allocate (biased)
                0..=44 => {
                    if shadow.states[idx] != SlotState::Empty {
                        continue;
                    }
                    let size = rng.gen_range_usize(1, 2048);
                    let align = 1 << rng.gen_range_usize(0, 7);
                    let s = seg.allocate(size, align);
                    let t = tree.allocate(size, align);
                    assert_eq!(
                        s.as_ptr() as usize % align,
                        0,
                        "seed={seed} step={step}: segregated block must honor its alignment"
                    );
                    assert_eq!(
                        t.as_ptr() as usize % align,
                        0,
                        "seed={seed} step={step}: tree block must honor its alignment"
                    );
                    shadow.seg_ptrs[idx] = s.as_ptr();
                    shadow.tree_ptrs[idx] = t.as_ptr();
                    shadow.sizes[idx] = size;
                    shadow.aligns[idx] = align;
                    shadow.states[idx] = SlotState::Live;
                }
                // release
                45..=69 => {
                    if shadow.states[idx] != SlotState::Live {
                        continue;
                    }
                    seg.release(shadow.seg_ptrs[idx]);
                    tree.release(shadow.tree_ptrs[idx]);
                    shadow.states[idx] = SlotState::Empty;
                }
                // resize, possibly moving the block
                70..=84 => {
                    if shadow.states[idx] != SlotState::Live {
                        continue;
                    }
                    let new_size = rng.gen_range_usize(1, 3072);
                    let s = seg
                        .resize(shadow.seg_ptrs[idx], new_size)
                        .expect("nonzero resize returns a block");
                    let t = tree
                        .resize(shadow.tree_ptrs[idx], new_size)
                        .expect("nonzero resize returns a block");
                    let align = shadow.aligns[idx];
                    assert_eq!(
                        s.as_ptr() as usize % align,
                        0,
                        "seed={seed} step={step}: segregated resize must keep the stored alignment"
                    );
                    assert_eq!(
                        t.as_ptr() as usize % align,
                        0,
                        "seed={seed} step={step}: tree resize must keep the stored alignment"
                    );
                    shadow.seg_ptrs[idx] = s.as_ptr();
                    shadow.tree_ptrs[idx] = t.as_ptr();
                    shadow.sizes[idx] = new_size;
                }
                // resize to zero is a release on both engines
                85..=94 => {
                    if shadow.states[idx] != SlotState::Live {
                        continue;
                    }
                    assert_eq!(
                        seg.resize(shadow.seg_ptrs[idx], 0),
                        None,
                        "seed={seed} step={step}: zero resize must release"
                    );
                    assert_eq!(
                        tree.resize(shadow.tree_ptrs[idx], 0),
                        None,
                        "seed={seed} step={step}: zero resize must release"
                    );
                    shadow.states[idx] = SlotState::Empty;
                }
                // quiet null release
                _ => {
                    seg.release(std::ptr::null_mut());
                    tree.release(std::ptr::null_mut());
                }
            }

            if step % 256 == 0 {
                checkpoint(seed, step, &seg, &tree, &shadow);
            }
        }

        checkpoint(seed, STEPS, &seg, &tree, &shadow);

        for idx in 0..SLOTS {
            if shadow.states[idx] == SlotState::Live {
                seg.release(shadow.seg_ptrs[idx]);
                tree.release(shadow.tree_ptrs[idx]);
                shadow.states[idx] = SlotState::Empty;
            }
        }

        assert_eq!(
            seg.bytes_in_use(),
            0,
            "seed={seed}: segregated heap must drain to zero"
        );
        assert_eq!(
            tree.bytes_in_use(),
            0,
            "seed={seed}: tree heap must drain to zero"
        );
        assert_eq!(
            seg.block_count(),
            seg.free_block_count(),
            "seed={seed}: every surviving segregated block must be free"
        );
        assert_eq!(
            tree.block_count(),
            tree.free_block_count(),
            "seed={seed}: every surviving tree block must be free"
        );
        seg.audit();
        tree.audit();
    }
}

#[test]
fn drained_churn_reuses_memory_instead_of_growing() {
    // Alternating fill/drain phases must settle into reuse: after the first
    // phase the reservation may grow, after that it must hold still.
    let mut seg = SegregatedHeap::with_config(HeapConfig::default());
    let mut tree = TreeHeap::with_config(HeapConfig::default());
    let mut rng = XorShift64::new(7);

    let mut high_water_seg = 0;
    let mut high_water_tree = 0;
    for phase in 0..6 {
        let mut seg_ptrs = Vec::new();
        let mut tree_ptrs = Vec::new();
        for _ in 0..64 {
            let size = rng.gen_range_usize(1, 4096);
            seg_ptrs.push(seg.allocate(size, 8));
            tree_ptrs.push(tree.allocate(size, 8));
        }
        for ptr in seg_ptrs.iter().rev() {
            seg.release(ptr.as_ptr());
        }
        for ptr in tree_ptrs.iter().rev() {
            tree.release(ptr.as_ptr());
        }

        if phase == 0 {
            high_water_seg = seg.bytes_reserved();
            high_water_tree = tree.bytes_reserved();
        } else {
            assert_eq!(
                seg.bytes_reserved(),
                high_water_seg,
                "phase={phase}: segregated heap must reuse its reservation"
            );
            assert_eq!(
                tree.bytes_reserved(),
                high_water_tree,
                "phase={phase}: tree heap must reuse its reservation"
            );
        }
        seg.audit();
        tree.audit();
    }
}
