//! The resource table and its per-resource FIFO wait queues.
//!
//! This crate implements the resource manager's core guarantees from
//! `spec.md` §4.F: conservation, no over-allocation, FIFO fairness per
//! resource, at-most-one-pending-request per process, and atomicity (every
//! `request`/`release`/`release_all` call mutates the resource table and the
//! relevant wait queue together, as one operation).
//!
//! Like `proctable`, `ResourceTable` is a plain data structure. The manager
//! holds it behind its own lock, acquired after the process-table lock and
//! before the clock lock (see `manager::Core`).

use std::collections::VecDeque;

use clock::Instant;
use proctable::Slot;

/// Hard upper bound on distinct resource types.
pub const MAX_RESOURCES: usize = 10;
/// Hard upper bound on instances of a single resource type.
pub const MAX_INSTANCES: u32 = 40;

/// Errors produced by resource-table operations. All are protocol errors
/// per `spec.md` §7: the caller logs and drops the offending message, the
/// manager never aborts because of one.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// `request`/`release` called with `count == 0`.
    #[error("count must be >= 1")]
    ZeroCount,
    /// The resource type index is out of range for this table.
    #[error("unknown resource type {0}")]
    UnknownResource(u8),
    /// A release asked for more units than the slot currently holds.
    #[error("slot holds fewer units than requested release")]
    NotHeld,
    /// The slot already has a request queued; a second concurrent request is
    /// a protocol error (invariant: at most one pending request per slot).
    #[error("slot already has a pending request")]
    AlreadyWaiting,
    /// The wait queue for this resource is at capacity (should not occur
    /// given the at-most-one-pending-request invariant).
    #[error("wait queue for resource {0} is full")]
    QueueFull(u8),
}

/// Outcome of a `request` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// The request was satisfied immediately.
    Immediate,
    /// Not enough units were available; the request was enqueued.
    Blocked,
}

/// A request that was drained off a wait queue and granted as a side effect
/// of a `release` or `release_all` call. The caller uses this to notify the
/// woken slot over the message transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    /// The slot that was granted its queued request.
    pub slot: Slot,
    /// The resource type granted.
    pub resource_type: u8,
    /// The number of units granted.
    pub count: u32,
}

/// Before/after availability, for log records (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accounting {
    /// Resource type affected.
    pub resource_type: u8,
    /// Units moved.
    pub count: u32,
    /// Availability before the operation.
    pub available_before: u32,
    /// Availability after the operation.
    pub available_after: u32,
}

#[derive(Debug, Clone, Copy)]
struct QueuedEntry {
    slot: Slot,
    count: u32,
    #[allow(dead_code)]
    enqueued_at: Instant,
}

struct Resource {
    total: u32,
    available: u32,
    allocated: [u32; proctable::MAX_SIMULTANEOUS],
    queue: VecDeque<QueuedEntry>,
}

impl Resource {
    fn new(total: u32) -> Self {
        Self {
            total,
            available: total,
            allocated: [0; proctable::MAX_SIMULTANEOUS],
            queue: VecDeque::new(),
        }
    }

    /// Conservation invariant for this resource: `available + sum(allocated)
    /// == total`.
    fn conserved(&self) -> bool {
        let held: u32 = self.allocated.iter().sum();
        self.available + held == self.total
    }
}

/// Running totals over `request`/`release` traffic. `deadlockRuns`,
/// `victimsTerminated`, and `normalTerminations` live in `manager`, since
/// they are produced by orchestration above this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Total `request` calls accepted (not counting protocol errors).
    pub total_requests: u64,
    /// Requests granted without queueing.
    pub immediate_grants: u64,
    /// Requests granted after having been queued.
    pub blocked_grants: u64,
}

/// The resource table: per-type totals, availability, per-slot allocation,
/// and the associated wait queues.
pub struct ResourceTable {
    resources: Vec<Resource>,
    waiting: [bool; proctable::MAX_SIMULTANEOUS],
    stats: RequestStats,
}

impl ResourceTable {
    /// Creates a table with one entry per element of `totals`, fixed at
    /// this value for the table's lifetime.
    pub fn new(totals: &[u32]) -> Self {
        assert!(totals.len() <= MAX_RESOURCES, "too many resource types");
        Self {
            resources: totals.iter().copied().map(Resource::new).collect(),
            waiting: [false; proctable::MAX_SIMULTANEOUS],
            stats: RequestStats::default(),
        }
    }

    /// Number of resource types in this table.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Total units configured for `r`.
    pub fn total(&self, r: u8) -> Result<u32, Error> {
        self.get(r).map(|res| res.total)
    }

    /// Units of `r` currently available.
    pub fn available(&self, r: u8) -> Result<u32, Error> {
        self.get(r).map(|res| res.available)
    }

    /// Units of `r` currently allocated to `slot`.
    pub fn allocated(&self, r: u8, slot: Slot) -> Result<u32, Error> {
        self.get(r).map(|res| res.allocated[slot.0])
    }

    /// Whether `slot` currently has a request queued on any resource.
    pub fn is_waiting(&self, slot: Slot) -> bool {
        self.waiting[slot.0]
    }

    /// Whether any resource's wait queue currently holds a blocked request.
    /// Used by the manager to trigger the deadlock detector on demand, in
    /// addition to its once-per-simulated-second debounced check (`spec.md`
    /// §4.G).
    pub fn has_queued_requests(&self) -> bool {
        self.resources.iter().any(|res| !res.queue.is_empty())
    }

    /// The queued need of `slot` for resource `r` — 0 if it has no request
    /// queued on `r`. Used by the deadlock detector as the Banker's "need"
    /// vector entry.
    pub fn queued_need(&self, r: u8, slot: Slot) -> Result<u32, Error> {
        let res = self.get(r)?;
        Ok(res.queue.iter().find(|q| q.slot == slot).map(|q| q.count).unwrap_or(0))
    }

    /// Running counters for `request`/`release` traffic.
    pub fn stats(&self) -> RequestStats {
        self.stats
    }

    fn get(&self, r: u8) -> Result<&Resource, Error> {
        self.resources.get(r as usize).ok_or(Error::UnknownResource(r))
    }

    fn get_mut(&mut self, r: u8) -> Result<&mut Resource, Error> {
        self.resources.get_mut(r as usize).ok_or(Error::UnknownResource(r))
    }

    /// Requests `n` units of resource `r` for `slot`.
    ///
    /// Grants immediately if enough units are available; otherwise enqueues
    /// the request at the tail of `r`'s wait queue (FIFO) and reports
    /// `Grant::Blocked`. Never grants a blocked request out of order.
    pub fn request(&mut self, slot: Slot, r: u8, n: u32, now: Instant) -> Result<(Grant, Accounting), Error> {
        if n == 0 {
            return Err(Error::ZeroCount);
        }
        if self.waiting[slot.0] {
            return Err(Error::AlreadyWaiting);
        }
        let res = self.get_mut(r)?;
        let available_before = res.available;

        if res.available >= n {
            res.available -= n;
            res.allocated[slot.0] += n;
            self.stats.total_requests += 1;
            self.stats.immediate_grants += 1;

            debug_assert!(res.conserved());
            tracing::info!(
                slot = slot.0,
                resource = r,
                units = n,
                avail_before = available_before,
                avail_after = res.available,
                "granting"
            );
            Ok((
                Grant::Immediate,
                Accounting {
                    resource_type: r,
                    count: n,
                    available_before,
                    available_after: res.available,
                },
            ))
        } else {
            if res.queue.len() >= proctable::MAX_SIMULTANEOUS {
                return Err(Error::QueueFull(r));
            }
            res.queue.push_back(QueuedEntry {
                slot,
                count: n,
                enqueued_at: now,
            });
            self.waiting[slot.0] = true;
            self.stats.total_requests += 1;

            tracing::debug!(slot = slot.0, resource = r, units = n, "blocked, enqueued");
            Ok((
                Grant::Blocked,
                Accounting {
                    resource_type: r,
                    count: n,
                    available_before,
                    available_after: res.available,
                },
            ))
        }
    }

    /// Releases `n` units of resource `r` held by `slot`, then drains `r`'s
    /// wait queue strictly in FIFO order, stopping at the first entry that
    /// cannot yet be satisfied.
    pub fn release(&mut self, slot: Slot, r: u8, n: u32) -> Result<(Accounting, Vec<Drained>), Error> {
        if n == 0 {
            return Err(Error::ZeroCount);
        }
        let res = self.get_mut(r)?;
        if res.allocated[slot.0] < n {
            return Err(Error::NotHeld);
        }

        let available_before = res.available;
        res.allocated[slot.0] -= n;
        res.available += n;

        tracing::info!(
            slot = slot.0,
            resource = r,
            units = n,
            avail_before = available_before,
            avail_after = res.available,
            "releasing"
        );

        let drained = self.drain_one(r);
        let res = self.get(r)?;
        Ok((
            Accounting {
                resource_type: r,
                count: n,
                available_before,
                available_after: res.available,
            },
            drained,
        ))
    }

    /// Returns every unit `slot` holds across all resources to `available`,
    /// removes it from any wait queue it is parked in, then drains every
    /// resource's wait queue in resource-index order.
    ///
    /// A no-op if `slot` holds nothing and is not queued anywhere — so
    /// calling this twice on an already-cleared slot is idempotent.
    pub fn release_all(&mut self, slot: Slot) -> Vec<Drained> {
        for res in &mut self.resources {
            let held = res.allocated[slot.0];
            if held > 0 {
                res.available += held;
                res.allocated[slot.0] = 0;
            }
            res.queue.retain(|q| q.slot != slot);
        }
        self.waiting[slot.0] = false;

        let mut drained = Vec::new();
        for r in 0..self.resources.len() as u8 {
            drained.extend(self.drain_one(r));
        }
        drained
    }

    fn drain_one(&mut self, r: u8) -> Vec<Drained> {
        let mut granted = Vec::new();
        loop {
            let res = match self.resources.get_mut(r as usize) {
                Some(res) => res,
                None => break,
            };
            let Some(head) = res.queue.front().copied() else { break };
            if res.available < head.count {
                break;
            }
            let _ = res.queue.pop_front();
            res.available -= head.count;
            res.allocated[head.slot.0] += head.count;
            self.waiting[head.slot.0] = false;
            self.stats.blocked_grants += 1;

            debug_assert!(res.conserved());
            tracing::info!(
                slot = head.slot.0,
                resource = r,
                units = head.count,
                avail_after = res.available,
                "granting (drained from wait queue)"
            );
            granted.push(Drained {
                slot: head.slot,
                resource_type: r,
                count: head.count,
            });
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(i: usize) -> Slot {
        Slot(i)
    }

    fn now() -> Instant {
        Instant::ZERO
    }

    #[test]
    fn immediate_grant() {
        let mut table = ResourceTable::new(&[10]);
        let (grant, acc) = table.request(slot(0), 0, 3, now()).unwrap();
        assert_eq!(grant, Grant::Immediate);
        assert_eq!(acc.available_after, 7);
        assert_eq!(table.available(0).unwrap(), 7);
        assert_eq!(table.allocated(0, slot(0)).unwrap(), 3);
        assert_eq!(table.stats().immediate_grants, 1);
    }

    #[test]
    fn blocked_then_drained_in_fifo_order() {
        let mut table = ResourceTable::new(&[2]);
        assert_eq!(table.request(slot(0), 0, 2, now()).unwrap().0, Grant::Immediate);
        assert_eq!(table.request(slot(1), 0, 1, now()).unwrap().0, Grant::Blocked);
        assert_eq!(table.request(slot(2), 0, 1, now()).unwrap().0, Grant::Blocked);

        let (_, drained) = table.release(slot(0), 0, 2).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].slot, slot(1));
        assert_eq!(drained[1].slot, slot(2));
        assert_eq!(table.available(0).unwrap(), 0);
        assert_eq!(table.stats().blocked_grants, 2);
    }

    #[test]
    fn fifo_queue_never_skips_ahead() {
        let mut table = ResourceTable::new(&[2]);
        table.request(slot(0), 0, 2, now()).unwrap();
        assert_eq!(table.request(slot(1), 0, 2, now()).unwrap().0, Grant::Blocked);
        assert_eq!(table.request(slot(2), 0, 1, now()).unwrap().0, Grant::Blocked);

        // Releasing 1 leaves available=1, but the head (P1) needs 2: no grant.
        let (_, drained) = table.release(slot(0), 0, 1).unwrap();
        assert!(drained.is_empty());
        assert_eq!(table.available(0).unwrap(), 1);

        // Releasing 1 more makes available=2: P1 is granted; P2 still can't (needs 1,
        // available now 0).
        let (_, drained) = table.release(slot(0), 0, 1).unwrap();
        assert_eq!(drained, vec![Drained { slot: slot(1), resource_type: 0, count: 2 }]);
        assert_eq!(table.available(0).unwrap(), 0);
        assert!(table.is_waiting(slot(2)));
    }

    #[test]
    fn release_more_than_held_is_rejected_with_no_partial_effect() {
        let mut table = ResourceTable::new(&[5]);
        table.request(slot(0), 0, 1, now()).unwrap();
        let err = table.release(slot(0), 0, 2).unwrap_err();
        assert_eq!(err, Error::NotHeld);
        assert_eq!(table.allocated(0, slot(0)).unwrap(), 1);
        assert_eq!(table.available(0).unwrap(), 4);
    }

    #[test]
    fn has_queued_requests_reflects_queue_occupancy() {
        let mut table = ResourceTable::new(&[1, 1]);
        assert!(!table.has_queued_requests());
        table.request(slot(0), 0, 1, now()).unwrap();
        assert!(!table.has_queued_requests());
        assert_eq!(table.request(slot(1), 0, 1, now()).unwrap().0, Grant::Blocked);
        assert!(table.has_queued_requests());
        table.release(slot(0), 0, 1).unwrap();
        assert!(!table.has_queued_requests());
    }

    #[test]
    fn zero_count_is_rejected_on_request_and_release() {
        let mut table = ResourceTable::new(&[1]);
        assert_eq!(table.request(slot(0), 0, 0, now()).unwrap_err(), Error::ZeroCount);
        table.request(slot(0), 0, 1, now()).unwrap();
        assert_eq!(table.release(slot(0), 0, 0).unwrap_err(), Error::ZeroCount);
    }

    #[test]
    fn double_request_while_already_waiting_is_a_protocol_error() {
        let mut table = ResourceTable::new(&[1, 1]);
        table.request(slot(0), 0, 1, now()).unwrap(); // exhausts resource 0
        assert_eq!(table.request(slot(1), 0, 1, now()).unwrap().0, Grant::Blocked);
        // P1 already has a pending request; a second Request message is a protocol error.
        assert_eq!(table.request(slot(1), 1, 1, now()).unwrap_err(), Error::AlreadyWaiting);
    }

    #[test]
    fn release_all_returns_everything_and_drains_all_queues() {
        let mut table = ResourceTable::new(&[1, 1]);
        table.request(slot(0), 0, 1, now()).unwrap();
        table.request(slot(0), 1, 1, now()).unwrap();
        assert_eq!(table.request(slot(1), 0, 1, now()).unwrap().0, Grant::Blocked);
        assert_eq!(table.request(slot(2), 1, 1, now()).unwrap().0, Grant::Blocked);

        let drained = table.release_all(slot(0));
        assert_eq!(drained.len(), 2);
        assert_eq!(table.allocated(0, slot(0)).unwrap(), 0);
        assert_eq!(table.allocated(1, slot(0)).unwrap(), 0);
        assert_eq!(table.allocated(0, slot(1)).unwrap(), 1);
        assert_eq!(table.allocated(1, slot(2)).unwrap(), 1);
    }

    #[test]
    fn release_all_on_already_cleared_slot_is_a_no_op() {
        let mut table = ResourceTable::new(&[4]);
        table.request(slot(0), 0, 2, now()).unwrap();
        table.release_all(slot(0));
        let before = table.available(0).unwrap();
        let drained = table.release_all(slot(0));
        assert!(drained.is_empty());
        assert_eq!(table.available(0).unwrap(), before);
    }

    #[test]
    fn request_then_release_is_a_round_trip() {
        let mut table = ResourceTable::new(&[6]);
        let before = table.available(0).unwrap();
        table.request(slot(0), 0, 3, now()).unwrap();
        table.release(slot(0), 0, 3).unwrap();
        assert_eq!(table.available(0).unwrap(), before);
        assert_eq!(table.allocated(0, slot(0)).unwrap(), 0);
    }

    #[test]
    fn conservation_holds_through_a_mixed_sequence() {
        let mut table = ResourceTable::new(&[5]);
        table.request(slot(0), 0, 2, now()).unwrap();
        table.request(slot(1), 0, 2, now()).unwrap();
        table.request(slot(2), 0, 3, now()).unwrap(); // blocked, needs 3 but only 1 left
        table.release(slot(0), 0, 2).unwrap(); // available=3, still < 3 needed... wait drains when enough
        let total = table.available(0).unwrap()
            + table.allocated(0, slot(0)).unwrap()
            + table.allocated(0, slot(1)).unwrap()
            + table.allocated(0, slot(2)).unwrap();
        assert_eq!(total, 5);
    }
}
