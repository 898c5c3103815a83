//! The shared state every step of the manager loop reads or mutates.
//!
//! `Core` owns the three locks `spec.md` §5 requires — process table,
//! resource table, simulated clock — and enforces their acquisition order
//! (process → resource → clock) by never holding more than one of its own
//! `Mutex`es across a call into another. The clock has no exposed lock of
//! its own to take out of order: `SimulatedClock` already serializes itself
//! internally (see `clock`, which reaches for `parking_lot` because it is
//! read on every tick; `processes`, `resources`, `transport`, and `stats`
//! here are touched far less often, so they use plain `std::sync::Mutex`,
//! the same choice the teacher makes for its own infrequently-touched
//! registries).

use std::sync::Mutex;

use clock::{Instant, SimulatedClock};
use proctable::{ProcessTable, Slot, WorkerId};
use restable::ResourceTable;
use transport::{ManagerTransport, Message, Notification, WorkerHandle};

use crate::{Error, Stats};

/// The counters orchestration owns outright — request/grant traffic is
/// `restable`'s own `RequestStats`, read directly off the resource table
/// rather than re-tallied here (see `Core::stats`).
#[derive(Debug, Clone, Copy, Default)]
struct OrchestrationStats {
    deadlock_runs: u64,
    victims_terminated: u64,
    normal_terminations: u64,
}

/// Bundles the three coordination tables and the statistics they produce,
/// each behind its own lock, threaded through every entry point instead of
/// living as file-scope globals.
pub struct Core {
    processes: Mutex<ProcessTable>,
    resources: Mutex<ResourceTable>,
    clock: SimulatedClock,
    transport: Mutex<ManagerTransport>,
    stats: Mutex<OrchestrationStats>,
}

impl Core {
    /// Creates a core with one resource type per entry of `resource_totals`
    /// and a transport sized to `transport_capacity`.
    pub fn new(resource_totals: &[u32], transport_capacity: usize) -> Self {
        Self {
            processes: Mutex::new(ProcessTable::new()),
            resources: Mutex::new(ResourceTable::new(resource_totals)),
            clock: SimulatedClock::new(),
            transport: Mutex::new(ManagerTransport::new(transport_capacity)),
            stats: Mutex::new(OrchestrationStats::default()),
        }
    }

    /// The simulated clock.
    pub fn clock(&self) -> &SimulatedClock {
        &self.clock
    }

    /// A snapshot of the running statistics: request/grant traffic read
    /// straight off `restable`'s own counters, composed with the
    /// orchestration-level counters (`deadlockRuns`, `victimsTerminated`,
    /// `normalTerminations`) this crate is responsible for.
    pub fn stats(&self) -> Stats {
        let request_stats = self.resources.lock().expect("resource table lock poisoned").stats();
        let orchestration = *self.stats.lock().expect("stats lock poisoned");
        Stats {
            total_requests: request_stats.total_requests,
            immediate_grants: request_stats.immediate_grants,
            blocked_grants: request_stats.blocked_grants,
            deadlock_runs: orchestration.deadlock_runs,
            victims_terminated: orchestration.victims_terminated,
            normal_terminations: orchestration.normal_terminations,
        }
    }

    /// Whether any resource's wait queue currently holds a blocked request —
    /// the on-demand trigger for the deadlock detector, alongside the
    /// debounced once-per-simulated-second check (`spec.md` §4.G).
    pub fn has_pending_waiters(&self) -> bool {
        self.resources.lock().expect("resource table lock poisoned").has_queued_requests()
    }

    /// Registers `worker_id` in the process table and the transport,
    /// returning the slot it was assigned and its side of the transport.
    pub fn register(&self, worker_id: WorkerId) -> Result<(Slot, WorkerHandle), Error> {
        let now = self.clock.read();
        let slot = {
            let mut processes = self.processes.lock().expect("process table lock poisoned");
            processes.register(worker_id, now)?
        };
        let handle = self.transport.lock().expect("transport lock poisoned").register(worker_id);
        Ok((slot, handle))
    }

    /// Whether a new worker may still be registered (a free slot exists).
    pub fn has_free_slot(&self) -> bool {
        self.processes.lock().expect("process table lock poisoned").occupied_count() < proctable::MAX_SIMULTANEOUS
    }

    /// Live and lifetime worker counts, for the launch-throttling decision.
    pub fn worker_counts(&self) -> (usize, u64) {
        let processes = self.processes.lock().expect("process table lock poisoned");
        (processes.current_children(), processes.total_launched())
    }

    /// Whether every slot is free (the loop's termination condition).
    pub fn is_idle(&self) -> bool {
        self.processes.lock().expect("process table lock poisoned").occupied_count() == 0
    }

    /// The next message waiting in the transport, if any. Never blocks.
    pub fn try_recv(&self) -> Option<Message> {
        self.transport.lock().expect("transport lock poisoned").try_recv()
    }

    /// The worker id occupying `slot`, if still occupied.
    pub fn worker_id_for(&self, slot: Slot) -> Option<WorkerId> {
        self.processes
            .lock()
            .expect("process table lock poisoned")
            .view(slot)
            .map(|view| view.worker_id)
    }

    /// The slot `worker_id` occupies, if still registered.
    pub fn slot_for(&self, worker_id: WorkerId) -> Option<Slot> {
        self.processes.lock().expect("process table lock poisoned").lookup(worker_id).ok()
    }

    /// The lifecycle state of `slot`, if still occupied.
    pub fn process_state(&self, slot: Slot) -> Option<proctable::State> {
        self.processes.lock().expect("process table lock poisoned").view(slot).map(|view| view.state)
    }

    /// Slots whose synthetic unblock time has passed `now`, transitioned
    /// back to `Running` as a side effect.
    pub fn unblock_timed_out_waiters(&self, now: Instant) -> Vec<Slot> {
        let mut processes = self.processes.lock().expect("process table lock poisoned");
        let timed_out = processes.timed_out_waiters(now);
        for &slot in &timed_out {
            let _ = processes.mark_running(slot);
        }
        timed_out
    }

    /// Applies one message from a worker: a `Request`, `Release`, or
    /// `Terminate`. Protocol errors (unknown sender, malformed count, a
    /// second request while already waiting) are logged and dropped — they
    /// never abort the loop.
    pub fn handle_message(&self, message: Message) {
        let slot = match self.slot_for(message.sender) {
            Some(slot) => slot,
            None => {
                tracing::warn!(sender = ?message.sender, "message from an unregistered worker");
                return;
            }
        };

        match message.kind {
            transport::MessageKind::Request { resource_type, count } => {
                self.handle_request(slot, message.sender, resource_type, count);
            }
            transport::MessageKind::Release { resource_type, count } => {
                self.handle_release(slot, resource_type, count);
            }
            transport::MessageKind::Terminate => {
                self.terminate(slot, message.sender, false);
            }
        }
    }

    fn handle_request(&self, slot: Slot, worker_id: WorkerId, resource_type: u8, count: u32) {
        let now = self.clock.read();
        let outcome = self
            .resources
            .lock()
            .expect("resource table lock poisoned")
            .request(slot, resource_type, count, now);
        match outcome {
            // `resources.request` already tallied `total_requests`/
            // `immediate_grants` internally; nothing left to count here.
            Ok((restable::Grant::Immediate, _)) => {
                let _ = self.notify(worker_id, Notification::Granted { resource_type, count });
            }
            Ok((restable::Grant::Blocked, _)) => {
                let _ = self
                    .processes
                    .lock()
                    .expect("process table lock poisoned")
                    .mark_blocked(slot, proctable::PendingRequest { resource_type, count });
            }
            Err(err) => tracing::warn!(slot = slot.0, %err, "request rejected"),
        }
    }

    fn handle_release(&self, slot: Slot, resource_type: u8, count: u32) {
        let outcome = self
            .resources
            .lock()
            .expect("resource table lock poisoned")
            .release(slot, resource_type, count);
        match outcome {
            // A release never changes the releaser's own run/wait status: it
            // may still be Waiting on an unrelated resource. Only the slots
            // actually drained off a wait queue (handled by `apply_drained`)
            // transition back to Running.
            Ok((_, drained)) => self.apply_drained(drained),
            Err(err) => tracing::warn!(slot = slot.0, %err, "release rejected"),
        }
    }

    /// Releases everything `slot` holds, clears its wait-queue entries, and
    /// frees the process-table slot. Used for both normal exits (`Terminate`
    /// message) and deadlock victimization.
    pub fn terminate(&self, slot: Slot, worker_id: WorkerId, is_victim: bool) {
        let drained = self.resources.lock().expect("resource table lock poisoned").release_all(slot);
        self.apply_drained(drained);

        if self.processes.lock().expect("process table lock poisoned").clear(slot).is_ok() {
            self.transport.lock().expect("transport lock poisoned").deregister(worker_id);
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            if is_victim {
                stats.victims_terminated += 1;
            } else {
                stats.normal_terminations += 1;
            }
        }
    }

    /// Marks each drained wait-queue entry's slot running again, notifies its
    /// worker — `resources.release`/`release_all` already counted each of
    /// these as a blocked grant when it drained the entry off its queue.
    fn apply_drained(&self, drained: Vec<restable::Drained>) {
        for entry in drained {
            let _ = self.processes.lock().expect("process table lock poisoned").mark_running(entry.slot);
            if let Some(worker_id) = self.worker_id_for(entry.slot) {
                let _ = self.notify(
                    worker_id,
                    Notification::Granted {
                        resource_type: entry.resource_type,
                        count: entry.count,
                    },
                );
            }
        }
    }

    /// Sends a notification to `worker_id`, logging (not propagating) any
    /// failure — the manager never aborts because one worker's outbox is
    /// gone.
    pub fn notify(&self, worker_id: WorkerId, notification: Notification) -> Result<(), Error> {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .notify(worker_id, notification)
            .map_err(Into::into)
    }

    /// Runs the Banker's safety check over the current snapshot.
    pub fn run_safety_check(&self) -> detector::Verdict {
        let processes = self.processes.lock().expect("process table lock poisoned");
        let resources = self.resources.lock().expect("resource table lock poisoned");
        detector::run(&processes, &resources)
    }

    /// Picks a victim among `unfinished` slots.
    pub fn choose_victim(&self, unfinished: &[Slot]) -> Option<Slot> {
        let resources = self.resources.lock().expect("resource table lock poisoned");
        detector::choose_victim(unfinished, &resources)
    }

    /// A point-in-time snapshot of both tables, for periodic logging.
    pub fn table_snapshot(&self) -> TableSnapshot {
        let processes = self.processes.lock().expect("process table lock poisoned");
        let resources = self.resources.lock().expect("resource table lock poisoned");
        TableSnapshot {
            occupied: processes.occupied_count(),
            current_children: processes.current_children(),
            total_launched: processes.total_launched(),
            available: (0..resources.resource_count() as u8)
                .map(|r| resources.available(r).unwrap_or(0))
                .collect(),
        }
    }

    /// Every occupied `(slot, worker_id)` pair, for final shutdown cleanup.
    pub fn occupied(&self) -> Vec<(Slot, WorkerId)> {
        self.processes
            .lock()
            .expect("process table lock poisoned")
            .occupied()
            .map(|view| (view.slot, view.worker_id))
            .collect()
    }

    /// Records one deadlock-detector pass.
    pub fn record_deadlock_run(&self) {
        self.stats.lock().expect("stats lock poisoned").deadlock_runs += 1;
    }
}

/// A read-only snapshot of table occupancy and availability, for the
/// manager loop's periodic log record.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    /// Occupied process-table slots.
    pub occupied: usize,
    /// Live worker count.
    pub current_children: usize,
    /// Lifetime launch count.
    pub total_launched: u64,
    /// Units available per resource type, in index order.
    pub available: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use transport::MessageKind;

    use super::*;

    fn request(sender: WorkerId, resource_type: u8, count: u32) -> Message {
        Message {
            sender,
            kind: MessageKind::Request { resource_type, count },
        }
    }

    fn release(sender: WorkerId, resource_type: u8, count: u32) -> Message {
        Message {
            sender,
            kind: MessageKind::Release { resource_type, count },
        }
    }

    #[test]
    fn releasing_one_resource_does_not_wake_a_slot_still_queued_on_another() {
        let core = Core::new(&[1, 1], transport::MIN_CAPACITY);
        let (p0, _h0) = core.register(WorkerId(0)).unwrap();
        let (p1, _h1) = core.register(WorkerId(1)).unwrap();

        // P0 holds r0; P1 holds r1; P0 additionally queues on r1 (blocked,
        // since P1 holds it) — a slot legally Waiting while it still holds
        // resources elsewhere.
        core.handle_message(request(WorkerId(0), 0, 1));
        core.handle_message(request(WorkerId(1), 1, 1));
        core.handle_message(request(WorkerId(0), 1, 1));
        assert_eq!(core.process_state(p0), Some(proctable::State::Waiting));

        // Releasing P0's r0 must not flip P0 back to Running: it is still
        // parked on r1's wait queue and restable's `waiting` bit for it is
        // still set.
        core.handle_message(release(WorkerId(0), 0, 1));
        assert_eq!(core.process_state(p0), Some(proctable::State::Waiting));
        assert_eq!(core.process_state(p1), Some(proctable::State::Running));
    }

    #[test]
    fn has_pending_waiters_reports_queue_occupancy() {
        let core = Core::new(&[1], transport::MIN_CAPACITY);
        let (_p0, _h0) = core.register(WorkerId(0)).unwrap();
        let (_p1, _h1) = core.register(WorkerId(1)).unwrap();

        assert!(!core.has_pending_waiters());
        core.handle_message(request(WorkerId(0), 0, 1));
        assert!(!core.has_pending_waiters());
        core.handle_message(request(WorkerId(1), 0, 1));
        assert!(core.has_pending_waiters());

        core.handle_message(release(WorkerId(0), 0, 1));
        assert!(!core.has_pending_waiters());
    }

    #[test]
    fn stats_composes_request_traffic_from_restable_and_orchestration_counters_locally() {
        let core = Core::new(&[2], transport::MIN_CAPACITY);
        let (_p0, _h0) = core.register(WorkerId(0)).unwrap();
        core.handle_message(request(WorkerId(0), 0, 1));

        let stats = core.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.immediate_grants, 1);
        assert_eq!(stats.blocked_grants, 0);
        assert_eq!(stats.deadlock_runs, 0);

        core.record_deadlock_run();
        assert_eq!(core.stats().deadlock_runs, 1);
    }
}
