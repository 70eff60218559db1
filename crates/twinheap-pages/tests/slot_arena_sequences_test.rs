use twinheap_pages::arena::{NIL, SlotArena, SlotIndex};

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    stamp: u64,
    serial: u32,
    echo: u32,
}

/// Deterministic churn against a shadow model: every live slot must read
/// back exactly the record most recently written to it, across bump growth,
/// cursor retraction, and free-stack recycling.
#[test]
fn deterministic_slot_arena_sequences_preserve_records() {
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 4_000;
    const SLOTS: usize = 48;

    for seed in SEEDS {
        let mut arena = SlotArena::<Record>::new(4096);
        let mut rng = XorShift64::new(seed);

        let mut handles = [NIL; SLOTS];
        let mut shadow = [None::<Record>; SLOTS];
        let mut serial = 0u32;

        for step in 0..STEPS {
            let op = rng.gen_range_usize(0, 99);
            let idx = rng.gen_range_usize(0, SLOTS - 1);

            match op {
                // allocate (biased)
                0..=49 => {
                    if shadow[idx].is_some() {
                        continue;
                    }
                    serial += 1;
                    let record = Record {
                        stamp: rng.next_u64(),
                        serial,
                        echo: serial ^ 0xa5a5_a5a5,
                    };
                    handles[idx] = arena.allocate_slot(record);
                    shadow[idx] = Some(record);
                }
                // release
                50..=74 => {
                    if shadow[idx].take().is_some() {
                        arena.release_slot(handles[idx]);
                        handles[idx] = NIL;
                    }
                }
                // rewrite in place
                75..=89 => {
                    if let Some(expected) = shadow[idx].as_mut() {
                        expected.stamp = rng.next_u64();
                        let live = arena.get_mut(handles[idx]);
                        live.stamp = expected.stamp;
                    }
                }
                // audit one slot
                _ => {
                    if let Some(expected) = shadow[idx] {
                        let got = *arena.get(handles[idx]);
                        assert_eq!(
                            got, expected,
                            "seed={seed} step={step}: slot {idx} record drifted"
                        );
                    }
                }
            }

            let live = shadow.iter().filter(|s| s.is_some()).count();
            assert_eq!(
                arena.live_slots(),
                live,
                "seed={seed} step={step}: live-slot accounting drifted"
            );
        }

        // Full audit at quiescence.
        for (idx, expected) in shadow.iter().enumerate() {
            if let Some(expected) = expected {
                assert_eq!(
                    arena.get(handles[idx]),
                    expected,
                    "seed={seed}: final audit, slot {idx}"
                );
            }
        }
    }
}

/// Handles handed out across a long churn must stay unique while live.
#[test]
fn deterministic_slot_arena_sequences_keep_handles_unique() {
    const STEPS: usize = 2_000;
    const SLOTS: usize = 32;

    let mut arena = SlotArena::<Record>::new(4096);
    let mut rng = XorShift64::new(0xfeed);
    let mut handles: Vec<SlotIndex> = Vec::new();

    for step in 0..STEPS {
        if handles.len() < SLOTS || rng.gen_range_usize(0, 1) == 0 {
            let h = arena.allocate_slot(Record {
                stamp: step as u64,
                serial: step as u32,
                echo: 0,
            });
            assert!(
                !handles.contains(&h),
                "step={step}: handle {h} handed out twice while live"
            );
            handles.push(h);
        } else {
            let pick = rng.gen_range_usize(0, handles.len() - 1);
            let h = handles.swap_remove(pick);
            arena.release_slot(h);
        }
    }
}
