//! Deadline-sorted timer list (component E).
//!
//! Entries are kept in a `Vec` sorted by ascending `when`, with insertion by
//! linear scan from the head — the same algorithm the original uses for its
//! `__ev_timer` ring, rather than a `BinaryHeap`. For the small number of
//! concurrently-sleeping fibers a scheduler typically has, O(n) insert with
//! O(1) peek-head and O(1) pop-head is simpler to reason about and keeps
//! FIFO tie-breaking trivial (ties keep insertion order, matching spec 3).

use std::time::Instant;

use crate::scheduler::FiberId;

struct TimerEntry {
    when: Instant,
    fiber: FiberId,
}

/// The scheduler's timer list.
#[derive(Default)]
pub struct TimerList {
    entries: Vec<TimerEntry>,
}

impl TimerList {
    pub fn new() -> Self {
        TimerList { entries: Vec::new() }
    }

    /// Inserts `fiber` to fire at `when`, at the first position whose
    /// existing entry has a strictly later deadline (ties keep insertion
    /// order, i.e. new entries with an equal `when` go after existing ones).
    pub fn insert(&mut self, fiber: FiberId, when: Instant) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.when > when)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, TimerEntry { when, fiber });
    }

    /// Removes a specific fiber from the timer list before it fires, e.g.
    /// when an I/O wait with a timer fallback resolves via the I/O side
    /// first.
    pub fn cancel(&mut self, fiber: FiberId) {
        self.entries.retain(|e| e.fiber != fiber);
    }

    /// The deadline of the earliest entry, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.when)
    }

    /// True if the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry whose deadline is `<= now`, in
    /// ascending-deadline order.
    pub fn expire(&mut self, now: Instant) -> Vec<FiberId> {
        let split = self.entries.partition_point(|e| e.when <= now);
        self.entries.drain(..split).map(|e| e.fiber).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(n: u64) -> FiberId {
        FiberId::from_raw(n)
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let base = Instant::now();
        let mut list = TimerList::new();
        list.insert(id(1), base + Duration::from_millis(150));
        list.insert(id(2), base + Duration::from_millis(50));
        list.insert(id(3), base + Duration::from_millis(100));

        assert_eq!(list.next_deadline(), Some(base + Duration::from_millis(50)));
        let expired = list.expire(base + Duration::from_millis(100));
        assert_eq!(expired, vec![id(2), id(3)]);
        assert_eq!(list.next_deadline(), Some(base + Duration::from_millis(150)));
    }

    #[test]
    fn ties_keep_insertion_order() {
        let base = Instant::now();
        let mut list = TimerList::new();
        list.insert(id(1), base);
        list.insert(id(2), base);
        list.insert(id(3), base);

        assert_eq!(list.expire(base), vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn cancel_removes_entry() {
        let base = Instant::now();
        let mut list = TimerList::new();
        list.insert(id(1), base);
        list.insert(id(2), base);
        list.cancel(id(1));
        assert_eq!(list.expire(base), vec![id(2)]);
    }
}
