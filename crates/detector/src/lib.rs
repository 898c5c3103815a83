//! Banker's-style safety check and victim selection.
//!
//! This crate is a pure algorithm over a borrowed snapshot of the process
//! and resource tables — it never mutates either. `manager` is responsible
//! for running it, acting on the verdict (calling `restable::release_all`
//! and `proctable::clear` on a chosen victim), and re-running until safe.

use proctable::{ProcessTable, Slot};
use restable::ResourceTable;

/// The outcome of one safety-check pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// `false` iff every occupied slot can finish (a safe state).
    pub unsafe_state: bool,
    /// Occupied slots that could not be shown to finish, in process-table
    /// order. Empty iff the system is safe.
    pub unfinished: Vec<Slot>,
}

/// Runs the Banker's safety check described in `spec.md` §4.G:
///
/// 1. `work[r] = available[r]`, `finish[i] = false` for every occupied `i`.
/// 2. Repeatedly find an unfinished `i` whose queued need is covered by
///    `work`; if found, fold its allocation into `work` and mark it
///    finished. Stop when no such `i` remains.
/// 3. The system is unsafe iff any occupied slot is still unfinished.
pub fn run(processes: &ProcessTable, resources: &ResourceTable) -> Verdict {
    let occupied: Vec<Slot> = processes.occupied().map(|p| p.slot).collect();
    let resource_count = resources.resource_count();

    let mut work: Vec<u32> = (0..resource_count as u8)
        .map(|r| resources.available(r).unwrap_or(0))
        .collect();
    let mut finished = vec![false; occupied.len()];

    loop {
        let mut progressed = false;
        for (idx, &slot) in occupied.iter().enumerate() {
            if finished[idx] {
                continue;
            }
            let can_finish = (0..resource_count as u8).all(|r| {
                let need = resources.queued_need(r, slot).unwrap_or(0);
                need <= work[r as usize]
            });
            if can_finish {
                for r in 0..resource_count as u8 {
                    work[r as usize] += resources.allocated(r, slot).unwrap_or(0);
                }
                finished[idx] = true;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    let unfinished: Vec<Slot> = occupied
        .into_iter()
        .zip(finished.iter())
        .filter_map(|(slot, &done)| (!done).then_some(slot))
        .collect();

    let unsafe_state = !unfinished.is_empty();
    if unsafe_state {
        tracing::warn!(count = unfinished.len(), "deadlock check: system is unsafe");
    } else {
        tracing::debug!("deadlock check: system is safe");
    }

    Verdict { unsafe_state, unfinished }
}

/// Picks a victim among `unfinished` slots: the one holding the greatest
/// total number of allocated units across every resource, ties broken by
/// the highest slot index (deterministic, per `spec.md`'s redesign of the
/// original "first unfinished" policy).
pub fn choose_victim(unfinished: &[Slot], resources: &ResourceTable) -> Option<Slot> {
    let resource_count = resources.resource_count() as u8;
    unfinished
        .iter()
        .copied()
        .map(|slot| {
            let held: u32 = (0..resource_count).map(|r| resources.allocated(r, slot).unwrap_or(0)).sum();
            (slot, held)
        })
        .max_by_key(|&(slot, held)| (held, slot.0))
        .map(|(slot, _)| slot)
}
