//! In-memory journal of rare heap lifecycle events.
//!
//! Allocation and release are far too hot to log, so the journal records only
//! the events that change the heap's relationship with the OS: the initial
//! reservation, each growth step, and full clears. The harness drains the
//! journal after a workload and serializes it into its report.

use std::collections::VecDeque;

use serde::Serialize;

/// Default number of events a journal retains before dropping the oldest.
pub const JOURNAL_DEPTH: usize = 64;

/// One lifecycle event, tagged for JSON output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeapEvent {
    /// The up-front reservation made by the constructor or `preallocate`.
    Preallocate { requested: usize, granted: usize },
    /// A growth step taken because no free block could satisfy a request.
    Grow {
        requested: usize,
        granted: usize,
        reserved: usize,
    },
    /// A full teardown of blocks and regions via `clear`.
    Clear { dropped_blocks: usize },
}

/// Bounded ring of [`HeapEvent`]s, oldest first.
#[derive(Debug)]
pub struct EventJournal {
    events: VecDeque<HeapEvent>,
    capacity: usize,
}

impl EventJournal {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        EventJournal {
            events: VecDeque::with_capacity(capacity.min(JOURNAL_DEPTH)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, event: HeapEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &HeapEvent> {
        self.events.iter()
    }

    /// Removes and returns every retained event, oldest first.
    pub fn take_all(&mut self) -> Vec<HeapEvent> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_newest_events_up_to_capacity() {
        let mut journal = EventJournal::with_capacity(3);
        for step in 0..5 {
            journal.record(HeapEvent::Grow {
                requested: step,
                granted: step,
                reserved: step,
            });
        }
        assert_eq!(journal.len(), 3);
        let kept: Vec<_> = journal.take_all();
        assert_eq!(
            kept[0],
            HeapEvent::Grow {
                requested: 2,
                granted: 2,
                reserved: 2
            }
        );
        assert!(journal.is_empty());
    }

    #[test]
    fn events_serialize_with_tags() {
        let text = serde_json::to_string(&HeapEvent::Preallocate {
            requested: 4096,
            granted: 4096,
        })
        .unwrap();
        assert_eq!(
            text,
            "{\"event\":\"preallocate\",\"requested\":4096,\"granted\":4096}"
        );
    }
}
