//! The process table: a fixed-capacity registry of live worker actors and
//! their lifecycle state.
//!
//! `ProcessTable` is a plain, non-self-locking data structure. The manager
//! owns one behind its own lock (see `manager::Core`) and is responsible for
//! the process → resource → clock lock ordering described in the design —
//! this crate only implements the state machine, not the synchronization.

use clock::Instant;

/// Hard upper bound on concurrently live workers, dictated by the fixed
/// width of the deadlock detector's Banker matrix.
pub const MAX_SIMULTANEOUS: usize = 18;

/// A stable index into the process table, valid for the lifetime of one
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub usize);

/// An opaque external identifier for a worker actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

/// Lifecycle state of an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The worker is runnable; it holds zero or more resources and has no
    /// pending request.
    Running,
    /// The worker has one request queued on some resource's wait queue.
    Waiting,
    /// Terminal. Absorbing: a terminated slot is freed immediately.
    Terminated,
}

/// The resource need that put a slot into `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// The resource type requested.
    pub resource_type: u8,
    /// The number of units requested.
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    occupied: bool,
    worker_id: WorkerId,
    start_time: Instant,
    state: State,
    unblock_at: Option<Instant>,
    pending: Option<PendingRequest>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            occupied: false,
            worker_id: WorkerId(0),
            start_time: Instant::ZERO,
            state: State::Terminated,
            unblock_at: None,
            pending: None,
        }
    }
}

/// Errors produced by process-table operations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No free slot was available to register a new worker.
    #[error("process table is full (max {0} simultaneous workers)")]
    Full(usize),
    /// The given worker or slot is not present in the table.
    #[error("worker not found")]
    NotFound,
}

/// A public, read-only view of one occupied slot.
#[derive(Debug, Clone, Copy)]
pub struct ProcessView {
    /// The slot's stable index.
    pub slot: Slot,
    /// The worker this slot belongs to.
    pub worker_id: WorkerId,
    /// The simulated time at which the worker was registered.
    pub start_time: Instant,
    /// The slot's current lifecycle state.
    pub state: State,
    /// The request that blocked the slot, if `state == Waiting`.
    pub pending: Option<PendingRequest>,
}

/// Fixed-capacity registry of live workers, mirroring `spec.md`'s
/// `ProcessEntry` slot array.
pub struct ProcessTable {
    entries: [Entry; MAX_SIMULTANEOUS],
    /// Live worker count; incremented on `register`, decremented on `clear`.
    current_children: usize,
    /// Lifetime launch count; incremented on `register`, never decremented.
    total_launched: u64,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: [Entry::default(); MAX_SIMULTANEOUS],
            current_children: 0,
            total_launched: 0,
        }
    }

    /// Registers a new worker, snapshotting `now` as its start time.
    ///
    /// Finds the first unoccupied slot. Fails with `Error::Full` if none is
    /// free.
    pub fn register(&mut self, worker_id: WorkerId, now: Instant) -> Result<Slot, Error> {
        let index = self
            .entries
            .iter()
            .position(|e| !e.occupied)
            .ok_or(Error::Full(MAX_SIMULTANEOUS))?;

        self.entries[index] = Entry {
            occupied: true,
            worker_id,
            start_time: now,
            state: State::Running,
            unblock_at: None,
            pending: None,
        };
        self.current_children += 1;
        self.total_launched += 1;

        tracing::info!(slot = index, worker = worker_id.0, "worker registered");
        Ok(Slot(index))
    }

    /// Finds the slot currently occupied by `worker_id`.
    pub fn lookup(&self, worker_id: WorkerId) -> Result<Slot, Error> {
        self.entries
            .iter()
            .position(|e| e.occupied && e.worker_id == worker_id)
            .map(Slot)
            .ok_or(Error::NotFound)
    }

    /// Returns a read-only view of `slot`, if occupied.
    pub fn view(&self, slot: Slot) -> Option<ProcessView> {
        let entry = self.entries.get(slot.0)?;
        if !entry.occupied {
            return None;
        }
        Some(ProcessView {
            slot,
            worker_id: entry.worker_id,
            start_time: entry.start_time,
            state: entry.state,
            pending: entry.pending,
        })
    }

    /// Iterates over every currently occupied slot.
    pub fn occupied(&self) -> impl Iterator<Item = ProcessView> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.occupied.then_some(ProcessView {
                slot: Slot(i),
                worker_id: e.worker_id,
                start_time: e.start_time,
                state: e.state,
                pending: e.pending,
            })
        })
    }

    /// Number of occupied slots.
    pub fn occupied_count(&self) -> usize {
        self.entries.iter().filter(|e| e.occupied).count()
    }

    /// Live worker count (mirrors the original's `currentChildren`).
    pub fn current_children(&self) -> usize {
        self.current_children
    }

    /// Lifetime launch count (mirrors the original's `totalLaunched`).
    pub fn total_launched(&self) -> u64 {
        self.total_launched
    }

    /// Transitions `slot` to `Waiting`, recording what it is blocked on.
    ///
    /// Caller's responsibility: resources have already been found
    /// unavailable and the request enqueued on the relevant wait queue.
    pub fn mark_blocked(&mut self, slot: Slot, req: PendingRequest) -> Result<(), Error> {
        let entry = self.entries.get_mut(slot.0).filter(|e| e.occupied).ok_or(Error::NotFound)?;
        entry.state = State::Waiting;
        entry.unblock_at = None;
        entry.pending = Some(req);
        Ok(())
    }

    /// Transitions `slot` back to `Running`, clearing any pending request.
    pub fn mark_running(&mut self, slot: Slot) -> Result<(), Error> {
        let entry = self.entries.get_mut(slot.0).filter(|e| e.occupied).ok_or(Error::NotFound)?;
        entry.state = State::Running;
        entry.unblock_at = None;
        entry.pending = None;
        Ok(())
    }

    /// Sets a synthetic unblock time for a timed wait, distinct from the
    /// resource FIFO's own grant path (see `spec.md` §4.H step 5).
    pub fn set_unblock_at(&mut self, slot: Slot, at: Instant) -> Result<(), Error> {
        let entry = self.entries.get_mut(slot.0).filter(|e| e.occupied).ok_or(Error::NotFound)?;
        entry.unblock_at = Some(at);
        Ok(())
    }

    /// Slots whose synthetic `unblock_at` has passed `now`.
    pub fn timed_out_waiters(&self, now: Instant) -> Vec<Slot> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                if e.occupied && e.state == State::Waiting {
                    e.unblock_at.filter(|at| *at <= now).map(|_| Slot(i))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Marks `slot` terminated and immediately frees it.
    ///
    /// Caller's responsibility: all resources held by `slot` must already
    /// have been released (via the resource manager's `release_all`) before
    /// calling this — `clear` only performs the process-table bookkeeping
    /// half of `spec.md`'s combined `clear` operation.
    pub fn clear(&mut self, slot: Slot) -> Result<(), Error> {
        let entry = self.entries.get_mut(slot.0).filter(|e| e.occupied).ok_or(Error::NotFound)?;
        entry.state = State::Terminated;
        *entry = Entry::default();
        self.current_children = self.current_children.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(sec: u64) -> Instant {
        Instant { seconds: sec, nanoseconds: 0 }
    }

    #[test]
    fn register_finds_first_free_slot() {
        let mut table = ProcessTable::new();
        let s0 = table.register(WorkerId(1), t(0)).unwrap();
        let s1 = table.register(WorkerId(2), t(0)).unwrap();
        assert_eq!(s0, Slot(0));
        assert_eq!(s1, Slot(1));
        assert_eq!(table.current_children(), 2);
        assert_eq!(table.total_launched(), 2);
    }

    #[test]
    fn register_fails_when_full() {
        let mut table = ProcessTable::new();
        for i in 0..MAX_SIMULTANEOUS {
            table.register(WorkerId(i as u64), t(0)).unwrap();
        }
        assert_eq!(table.register(WorkerId(999), t(0)), Err(Error::Full(MAX_SIMULTANEOUS)));
    }

    #[test]
    fn clear_frees_the_slot_and_keeps_lifetime_count() {
        let mut table = ProcessTable::new();
        let slot = table.register(WorkerId(1), t(0)).unwrap();
        table.clear(slot).unwrap();
        assert_eq!(table.occupied_count(), 0);
        assert_eq!(table.current_children(), 0);
        assert_eq!(table.total_launched(), 1);

        // Slot is reusable.
        let reused = table.register(WorkerId(2), t(1)).unwrap();
        assert_eq!(reused, slot);
        assert_eq!(table.total_launched(), 2);
    }

    #[test]
    fn state_machine_transitions() {
        let mut table = ProcessTable::new();
        let slot = table.register(WorkerId(1), t(0)).unwrap();
        assert_eq!(table.view(slot).unwrap().state, State::Running);

        table
            .mark_blocked(slot, PendingRequest { resource_type: 0, count: 2 })
            .unwrap();
        let view = table.view(slot).unwrap();
        assert_eq!(view.state, State::Waiting);
        assert_eq!(view.pending, Some(PendingRequest { resource_type: 0, count: 2 }));

        table.mark_running(slot).unwrap();
        let view = table.view(slot).unwrap();
        assert_eq!(view.state, State::Running);
        assert_eq!(view.pending, None);
    }

    #[test]
    fn occupied_slot_is_never_observed_terminated() {
        let mut table = ProcessTable::new();
        let slot = table.register(WorkerId(1), t(0)).unwrap();
        for view in table.occupied() {
            assert_ne!(view.state, State::Terminated);
        }
        table.clear(slot).unwrap();
        assert!(table.view(slot).is_none());
    }

    #[test]
    fn timed_out_waiters_reports_only_elapsed_unblock_times() {
        let mut table = ProcessTable::new();
        let slot = table.register(WorkerId(1), t(0)).unwrap();
        table
            .mark_blocked(slot, PendingRequest { resource_type: 0, count: 1 })
            .unwrap();
        table.set_unblock_at(slot, t(5)).unwrap();

        assert!(table.timed_out_waiters(t(4)).is_empty());
        assert_eq!(table.timed_out_waiters(t(5)), vec![slot]);
    }
}
