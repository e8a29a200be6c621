use std::{cmp::Ordering, collections::BinaryHeap, time::Instant};

use crate::Signal;

/// Deadline-ordered signals.
///
/// Timers can't be cancelled, actors are expected to check their own deadlines when woken.
#[derive(Default)]
pub(crate) struct Timers {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    signal: Signal,
}

impl Timers {
    pub fn insert(&mut self, deadline: Instant, signal: Signal) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(TimerEntry {
            deadline,
            seq,
            signal,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Remove and return the signals of all timers that expired at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Signal> {
        let mut expired = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }

            if let Some(entry) = self.heap.pop() {
                expired.push(entry.signal);
            }
        }

        expired
    }
}

// Reversed, so the heap pops the earliest deadline first
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}
