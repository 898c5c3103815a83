#![deny(unsafe_code, unused_extern_crates, unused_import_braces)]
#![warn(unreachable_pub)]

//! The manager loop: the orchestrator that ties the clock, process table,
//! resource table, transport, and deadlock detector together.
//!
//! Grounded in the teacher's `engine::multi_threaded` run loop (own the
//! runtime, spawn a command/control task alongside the main work, join
//! everything on shutdown) and `engine::controllers`' cooperative stop
//! signal — here a `tokio_util::sync::CancellationToken` rather than the
//! teacher's `mpsc`-based `Command` channel, since the only command this
//! domain needs is "stop".

mod core;

use std::time::Duration;

use clock::Instant;
use config::Config;
use proctable::{Slot, WorkerId};
use tokio_util::sync::CancellationToken;

pub use crate::core::{Core, TableSnapshot};

/// Errors raised while registering workers or applying resource operations.
/// Protocol-level rejections (bad counts, unknown resources, double
/// requests) are logged and dropped inside `Core`; these variants are the
/// ones the manager loop itself cannot shrug off.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The process table has no free slot for a new worker.
    #[error(transparent)]
    ProcessTable(#[from] proctable::Error),
    /// The transport could not notify a worker.
    #[error(transparent)]
    Transport(#[from] transport::Error),
}

/// Running totals over one manager's lifetime, combining `restable`'s
/// request/grant counters with the orchestration-level counters `spec.md`
/// §4.A names (`deadlockRuns`, `victimsTerminated`, `normalTerminations`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Total `Request` messages accepted.
    pub total_requests: u64,
    /// Requests granted without queueing.
    pub immediate_grants: u64,
    /// Requests granted after having been queued.
    pub blocked_grants: u64,
    /// Number of completed deadlock-detector passes.
    pub deadlock_runs: u64,
    /// Workers terminated by the deadlock resolver.
    pub victims_terminated: u64,
    /// Workers that exited on their own via a `Terminate` message.
    pub normal_terminations: u64,
}

impl Stats {
    /// Average number of victims per deadlock-detector pass that found an
    /// unsafe state, mirroring the reference implementation's
    /// `logStatistics` summary. `None` until at least one pass has run.
    pub fn average_terminations_per_run(&self) -> Option<f64> {
        (self.deadlock_runs > 0).then(|| self.victims_terminated as f64 / self.deadlock_runs as f64)
    }
}

/// The manager: owns the shared `Core`, the worker supervisor, and the loop
/// that drives both to completion.
pub struct Manager {
    core: std::sync::Arc<Core>,
    supervisor: worker::WorkerSupervisor,
    config: Config,
    shutdown: CancellationToken,
    next_worker_id: u64,
    last_launch: Option<tokio::time::Instant>,
    last_deadlock_check_second: Option<u64>,
    last_snapshot_half_second: Option<u64>,
}

impl Manager {
    /// Validates `config` and creates a manager from it. Does not start the
    /// loop — call [`Manager::run`] for that.
    pub fn new(config: Config) -> Result<Self, config::Error> {
        config.validate_bounds()?;
        let core = Core::new(&config.resource_totals(), transport::MIN_CAPACITY);
        Ok(Self {
            core: std::sync::Arc::new(core),
            supervisor: worker::WorkerSupervisor::new(),
            config,
            shutdown: CancellationToken::new(),
            next_worker_id: 0,
            last_launch: None,
            last_deadlock_check_second: None,
            last_snapshot_half_second: None,
        })
    }

    /// A token external callers can cancel to request a graceful shutdown.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The shared coordination state, for callers that want to observe it
    /// (e.g. a test driving the loop from another task).
    pub fn core(&self) -> std::sync::Arc<Core> {
        self.core.clone()
    }

    /// Runs the eight-step loop (`spec.md` §4.H) until no worker may launch
    /// and none is occupied, the wall-clock runtime budget expires, or
    /// `shutdown_handle` is cancelled. Returns the final statistics.
    pub async fn run(mut self) -> Stats {
        self.core.clock().initialize();
        tracing::info!(
            max_processes = self.config.max_processes,
            max_simultaneous = self.config.max_simultaneous,
            max_resources = self.config.max_resources,
            "manager starting"
        );

        let mut last_tick = tokio::time::Instant::now();
        let started = tokio::time::Instant::now();
        let max_runtime = Duration::from_secs(self.config.max_runtime_seconds);

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested, draining");
                break;
            }
            if started.elapsed() >= max_runtime {
                tracing::info!("wall-clock runtime budget exhausted");
                break;
            }

            // 1. Reap workers whose task has already finished.
            for worker_id in self.supervisor.reap().await {
                if let Some(slot) = self.core.slot_for(worker_id) {
                    tracing::warn!(?worker_id, "worker task ended without a Terminate message");
                    self.core.terminate(slot, worker_id, false);
                }
            }

            // 2. Launch new workers, subject to the configured limits.
            self.maybe_launch();

            // 3. Drain the message transport.
            while let Some(message) = self.core.try_recv() {
                self.core.handle_message(message);
            }

            // 3b. On-demand deadlock check: any grant serviced above may have
            // left a wait queue non-empty (`spec.md` §4.G, "also on demand
            // after any grant that leaves at least one wait queue
            // non-empty"), independent of the once-per-simulated-second
            // debounce in step 6.
            if self.core.has_pending_waiters() {
                self.run_deadlock_check();
            }

            // 4. Advance the simulated clock.
            let wall_elapsed = last_tick.elapsed();
            last_tick = tokio::time::Instant::now();
            let now = self.core.clock().advance_for_wall_elapsed(wall_elapsed, self.config.sim_speed_factor);

            // 5. Unblock any synthetic timed waits that have elapsed.
            let _ = self.core.unblock_timed_out_waiters(now);

            // 6. Debounced, once-per-simulated-second deadlock check.
            if self.last_deadlock_check_second != Some(now.seconds) {
                self.last_deadlock_check_second = Some(now.seconds);
                self.run_deadlock_check();
            }

            // 7. Periodic table snapshot log, twice per simulated second.
            self.maybe_log_snapshot(now);

            // 8. Cede wall CPU briefly, or exit early on shutdown.
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }

            if self.core.is_idle() && !self.can_launch_more() {
                tracing::info!("no worker occupied and none left to launch, stopping");
                break;
            }
        }

        self.drain_on_shutdown().await;
        let stats = self.core.stats();
        tracing::info!(
            total_requests = stats.total_requests,
            immediate_grants = stats.immediate_grants,
            blocked_grants = stats.blocked_grants,
            deadlock_runs = stats.deadlock_runs,
            victims_terminated = stats.victims_terminated,
            normal_terminations = stats.normal_terminations,
            "manager stopped"
        );
        stats
    }

    fn can_launch_more(&self) -> bool {
        let (_, total_launched) = self.core.worker_counts();
        total_launched < self.config.max_processes as u64
    }

    fn maybe_launch(&mut self) {
        if !self.can_launch_more() || !self.core.has_free_slot() {
            return;
        }
        let (current_children, _) = self.core.worker_counts();
        if current_children >= self.config.max_simultaneous as usize {
            return;
        }
        let throttle = Duration::from_millis(self.config.launch_interval_ms);
        if let Some(last_launch) = self.last_launch {
            if last_launch.elapsed() < throttle {
                return;
            }
        }

        self.next_worker_id += 1;
        let worker_id = WorkerId(self.next_worker_id);
        let (slot, handle) = match self.core.register(worker_id) {
            Ok(registered) => registered,
            Err(err) => {
                tracing::warn!(%err, "failed to register new worker");
                return;
            }
        };

        let behavior = Box::new(worker::SimWorker {
            resource_count: self.config.max_resources as u8,
            min_lifespan: Duration::from_secs(self.config.child_time_limit_seconds),
        });
        self.supervisor.spawn(worker_id, behavior, handle, self.shutdown.clone());
        self.last_launch = Some(tokio::time::Instant::now());
        tracing::info!(?worker_id, slot = slot.0, "worker launched");
    }

    fn run_deadlock_check(&self) {
        loop {
            let verdict = self.core.run_safety_check();
            self.core.record_deadlock_run();
            tracing::debug!(unsafe_state = verdict.unsafe_state, unfinished = verdict.unfinished.len(), "deadlock check");
            if !verdict.unsafe_state {
                break;
            }
            let Some(victim) = self.core.choose_victim(&verdict.unfinished) else {
                break;
            };
            let Some(worker_id) = self.core.worker_id_for(victim) else {
                break;
            };
            tracing::warn!(slot = victim.0, ?worker_id, "deadlock detected, terminating victim");
            let _ = self.core.notify(worker_id, transport::Notification::Terminate);
            self.core.terminate(victim, worker_id, true);
        }
    }

    fn maybe_log_snapshot(&mut self, now: Instant) {
        let half_second = now.seconds * 2 + u64::from(now.nanoseconds >= clock::NANOS_PER_SEC as u32 / 2);
        if self.last_snapshot_half_second == Some(half_second) {
            return;
        }
        self.last_snapshot_half_second = Some(half_second);

        let snapshot = self.core.table_snapshot();
        let stats = self.core.stats();
        tracing::info!(
            sim_seconds = now.seconds,
            occupied = snapshot.occupied,
            current_children = snapshot.current_children,
            total_launched = snapshot.total_launched,
            available = ?snapshot.available,
            total_requests = stats.total_requests,
            avg_terminations_per_run = ?stats.average_terminations_per_run(),
            "table snapshot"
        );
    }

    async fn drain_on_shutdown(&mut self) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline && !self.supervisor.is_empty() {
            for worker_id in self.supervisor.reap().await {
                if let Some(slot) = self.core.slot_for(worker_id) {
                    self.core.terminate(slot, worker_id, false);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stragglers: Vec<(Slot, WorkerId)> = self.core.occupied();
        for (slot, worker_id) in stragglers {
            self.supervisor.kill(worker_id);
            self.core.terminate(slot, worker_id, false);
        }
    }
}
