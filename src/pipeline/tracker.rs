use crate::event::SourcePosition;
use std::collections::BTreeMap;

#[derive(Debug)]
struct Entry {
    position: SourcePosition,
    /// Operations still to be flushed. `None` until the event's operations are known.
    remaining: Option<usize>,
}

/// Ordered ledger of source positions whose operations are not yet durable.
///
/// Every event gets a ticket in log order. The checkpoint may move to an
/// event's position only once that event and every earlier one have no
/// outstanding operations. Adjacent completed entries collapse into the
/// later one, and nothing is recorded behind a held ticket, so the ledger
/// stays bounded while a faulted table pins the checkpoint.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    next_ticket: u64,
    entries: BTreeMap<u64, Entry>,
    /// Earliest ticket that will never complete in this run.
    barrier: Option<u64>,
    /// Events registered after the barrier.
    behind_barrier: usize,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, position: SourcePosition) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        if self.barrier.is_some() {
            self.behind_barrier += 1;
            return ticket;
        }
        self.entries.insert(
            ticket,
            Entry {
                position,
                remaining: None,
            },
        );
        ticket
    }

    /// Record how many operations must be flushed before `ticket` completes.
    /// Zero completes it immediately.
    pub fn attach(&mut self, ticket: u64, operations: usize) {
        if self.barrier == Some(ticket) {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&ticket) {
            entry.remaining = Some(operations);
            if operations == 0 {
                self.collapse(ticket);
            }
        }
    }

    /// Count `operations` flushed operations against `ticket`.
    pub fn complete(&mut self, ticket: u64, operations: usize) {
        if self.barrier == Some(ticket) {
            return;
        }
        if let Some(Some(remaining)) = self.entries.get_mut(&ticket).map(|e| e.remaining.as_mut()) {
            *remaining = remaining.saturating_sub(operations);
            if *remaining == 0 {
                self.collapse(ticket);
            }
        }
    }

    /// Mark `ticket` as never completing. The checkpoint stops in front of it
    /// and later events are only counted.
    pub fn hold(&mut self, ticket: u64) {
        if self.barrier.is_some_and(|barrier| barrier <= ticket) {
            return;
        }
        let Some(entry) = self.entries.get_mut(&ticket) else {
            return;
        };
        entry.remaining = None;
        let dropped = self.entries.split_off(&(ticket + 1));
        self.behind_barrier += dropped.len();
        self.barrier = Some(ticket);
    }

    fn collapse(&mut self, ticket: u64) {
        let done_before = self
            .entries
            .range(..ticket)
            .next_back()
            .filter(|(_, e)| e.remaining == Some(0))
            .map(|(t, _)| *t);
        if let Some(before) = done_before {
            self.entries.remove(&before);
        }
        let done_after = self
            .entries
            .range(ticket + 1..)
            .next()
            .is_some_and(|(_, e)| e.remaining == Some(0));
        if done_after {
            self.entries.remove(&ticket);
        }
    }

    /// Drop every fully applied ticket at the front of the ledger and return
    /// the last position released, if any.
    pub fn advance(&mut self) -> Option<SourcePosition> {
        let mut released = None;
        while let Some(entry) = self.entries.first_entry() {
            if entry.get().remaining != Some(0) {
                break;
            }
            released = Some(entry.remove().position);
        }
        released
    }

    /// Ledger entries not yet released plus events registered behind a held one.
    pub fn outstanding(&self) -> usize {
        self.entries.len() + self.behind_barrier
    }

    /// Entries kept in memory.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Position of the oldest event still blocking the checkpoint.
    pub fn oldest_outstanding(&self) -> Option<&SourcePosition> {
        self.entries.values().next().map(|e| &e.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(i: u64) -> SourcePosition {
        SourcePosition::from_index(i)
    }

    #[test]
    fn test_advances_only_over_contiguous_completions() {
        let mut tracker = OffsetTracker::new();
        let a = tracker.register(pos(0));
        let b = tracker.register(pos(1));
        let c = tracker.register(pos(2));
        tracker.attach(a, 1);
        tracker.attach(b, 2);
        tracker.attach(c, 1);

        tracker.complete(c, 1);
        assert_eq!(tracker.advance(), None, "earlier events still pending");

        tracker.complete(a, 1);
        tracker.complete(b, 1);
        assert_eq!(tracker.advance(), Some(pos(0)));

        tracker.complete(b, 1);
        assert_eq!(tracker.advance(), Some(pos(2)));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_zero_operation_events_complete_immediately() {
        let mut tracker = OffsetTracker::new();
        let ddl = tracker.register(pos(5));
        tracker.attach(ddl, 0);
        assert_eq!(tracker.advance(), Some(pos(5)));
    }

    #[test]
    fn test_unattached_ticket_blocks_checkpoint() {
        let mut tracker = OffsetTracker::new();
        let held = tracker.register(pos(0));
        let later = tracker.register(pos(1));
        tracker.attach(later, 0);

        assert_eq!(tracker.advance(), None);
        assert_eq!(tracker.oldest_outstanding(), Some(&pos(0)));

        tracker.attach(held, 0);
        assert_eq!(tracker.advance(), Some(pos(1)));
    }

    #[test]
    fn test_held_ticket_stops_checkpoint_and_bounds_ledger() {
        let mut tracker = OffsetTracker::new();
        let first = tracker.register(pos(0));
        tracker.attach(first, 0);
        let held = tracker.register(pos(1));
        tracker.hold(held);

        for i in 2..10_000 {
            let ticket = tracker.register(pos(i));
            tracker.attach(ticket, 1);
            tracker.complete(ticket, 1);
        }

        assert_eq!(tracker.advance(), Some(pos(0)));
        assert_eq!(tracker.advance(), None);
        assert_eq!(tracker.tracked(), 1);
        assert_eq!(tracker.outstanding(), 9_999);

        tracker.attach(held, 0);
        tracker.complete(held, 1);
        assert_eq!(tracker.advance(), None, "held tickets never complete");
    }

    #[test]
    fn test_completed_runs_collapse_behind_a_slow_ticket() {
        let mut tracker = OffsetTracker::new();
        let slow = tracker.register(pos(0));
        tracker.attach(slow, 3);

        for i in 1..1_000 {
            let ticket = tracker.register(pos(i));
            tracker.attach(ticket, 0);
        }
        assert_eq!(tracker.tracked(), 2);
        assert_eq!(tracker.advance(), None);

        tracker.complete(slow, 3);
        assert_eq!(tracker.advance(), Some(pos(999)));
        assert_eq!(tracker.outstanding(), 0);
    }
}
