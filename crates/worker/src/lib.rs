#![deny(unsafe_code, unused_extern_crates, unused_import_braces)]
#![warn(unreachable_pub)]

//! Worker actors and the supervisor that spawns and reaps them.
//!
//! `spec.md` §6 names this boundary the "abstract worker factory":
//! `spawn() -> workerId`, `kill(workerId)`, `reap() -> [workerId]`. Workers
//! themselves are in-process `tokio` tasks here, not child processes — the
//! same choice the teacher's engine made for receivers and exporters — so
//! `kill` aborts a task instead of sending a signal, and `reap` collects
//! `JoinHandle`s that have already finished.
//!
//! The one concrete behavior shipped, [`SimWorker`], is a direct port of the
//! reference implementation's randomized request/release/terminate loop
//! (`original_source/src/workerA5.c`): while running it alternates between
//! idling and, with 90% probability, requesting a random resource type (the
//! other 10%, releasing one it holds); once its simulated lifespan elapses
//! it releases everything it still holds and announces termination.

use std::{
    collections::HashMap,
    time::Duration,
};

use proctable::WorkerId;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::{Notification, WorkerHandle};

/// Probability, as a percentage, that a worker requests rather than
/// releases on a given action tick. Matches `REQUEST_PROBABILITY` in
/// `original_source/src/workerA5.c`.
pub const REQUEST_PROBABILITY_PCT: u8 = 90;

/// Probability, as a percentage, that a worker decides to terminate once
/// its minimum lifespan has elapsed, checked once per simulated second.
/// Matches the reference implementation's 10% per-second decision.
pub const TERMINATE_PROBABILITY_PCT: u8 = 10;

/// Upper bound, in milliseconds, on how long a worker idles between
/// actions. Matches the reference implementation's nanosecond bound
/// scaled to this crate's wall-clock-driven tick.
pub const MAX_ACTION_IDLE_MS: u64 = 250;

/// Errors produced while running a worker.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The transport to the manager was disconnected mid-run.
    #[error("transport to manager disconnected")]
    Disconnected(#[from] transport::Error),
}

/// A worker actor's behavior: given its transport handle and a cancellation
/// signal, runs until it decides to terminate or is cancelled.
#[async_trait::async_trait]
pub trait WorkerBehavior: Send + 'static {
    /// Runs the worker to completion.
    async fn run(self: Box<Self>, handle: WorkerHandle, shutdown: CancellationToken) -> Result<(), Error>;
}

/// Supervises in-process worker tasks: the crate's implementation of the
/// abstract worker factory's `spawn`/`kill`/`reap` boundary.
#[derive(Default)]
pub struct WorkerSupervisor {
    handles: HashMap<WorkerId, JoinHandle<Result<(), Error>>>,
}

impl WorkerSupervisor {
    /// Creates an empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `behavior` as `worker_id`, wired to `transport_handle`. The
    /// task is cancelled if `shutdown` fires before the behavior returns on
    /// its own.
    pub fn spawn(
        &mut self,
        worker_id: WorkerId,
        behavior: Box<dyn WorkerBehavior>,
        transport_handle: WorkerHandle,
        shutdown: CancellationToken,
    ) {
        let join = tokio::spawn(async move { behavior.run(transport_handle, shutdown).await });
        if let Some(previous) = self.handles.insert(worker_id, join) {
            previous.abort();
            tracing::warn!(?worker_id, "replaced a still-registered worker task");
        }
        tracing::info!(?worker_id, "worker spawned");
    }

    /// Unconditionally aborts `worker_id`'s task, if still registered. Used
    /// by the deadlock resolver on a chosen victim.
    pub fn kill(&mut self, worker_id: WorkerId) {
        if let Some(handle) = self.handles.remove(&worker_id) {
            handle.abort();
            tracing::info!(?worker_id, "worker killed");
        }
    }

    /// Removes and returns the ids of every worker whose task has already
    /// finished (normally or by panic), logging panics as they're found.
    ///
    /// Only handles already reported `is_finished` are awaited, so this
    /// never blocks on a worker that is still running.
    pub async fn reap(&mut self) -> Vec<WorkerId> {
        let finished: Vec<WorkerId> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(worker_id, _)| *worker_id)
            .collect();

        let mut reaped = Vec::with_capacity(finished.len());
        for worker_id in finished {
            if let Some(handle) = self.handles.remove(&worker_id) {
                match handle.await {
                    Ok(Err(err)) => tracing::warn!(?worker_id, %err, "worker task returned an error"),
                    Err(join_err) => tracing::error!(?worker_id, %join_err, "worker task panicked"),
                    Ok(Ok(())) => {}
                }
            }
            reaped.push(worker_id);
        }
        reaped
    }

    /// Number of workers still registered (whether running or merely not
    /// yet reaped).
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether any worker is still registered.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// The reference implementation's randomized request/release/terminate
/// behavior, ported from `original_source/src/workerA5.c`.
pub struct SimWorker {
    /// Number of distinct resource types it may request from.
    pub resource_count: u8,
    /// Minimum simulated lifespan before it starts rolling to terminate.
    pub min_lifespan: Duration,
}

#[async_trait::async_trait]
impl WorkerBehavior for SimWorker {
    async fn run(self: Box<Self>, handle: WorkerHandle, shutdown: CancellationToken) -> Result<(), Error> {
        let mut held = vec![0u32; self.resource_count as usize];
        let started = tokio::time::Instant::now();

        loop {
            let idle = Duration::from_millis(rand::thread_rng().gen_range(1..=MAX_ACTION_IDLE_MS));
            tokio::select! {
                _ = shutdown.cancelled() => {
                    release_everything(&handle, &mut held).await?;
                    return Ok(());
                }
                _ = tokio::time::sleep(idle) => {}
            }

            if started.elapsed() >= self.min_lifespan && rand::thread_rng().gen_range(0..100) < TERMINATE_PROBABILITY_PCT {
                tracing::debug!(worker_id = ?handle.worker_id(), "worker deciding to terminate");
                release_everything(&handle, &mut held).await?;
                handle.terminate().await?;
                return Ok(());
            }

            self.act(&handle, &mut held).await?;
        }
    }
}

impl SimWorker {
    async fn act(&self, handle: &WorkerHandle, held: &mut [u32]) -> Result<(), Error> {
        let resource_type = rand::thread_rng().gen_range(0..self.resource_count);
        let requesting = rand::thread_rng().gen_range(0..100) < REQUEST_PROBABILITY_PCT;

        if requesting {
            handle.request(resource_type, 1).await?;
            match handle.recv().await {
                Some(Notification::Granted { resource_type, count }) => {
                    held[resource_type as usize] += count;
                }
                Some(Notification::Terminate) | None => {}
            }
        } else if held[resource_type as usize] > 0 {
            handle.release(resource_type, 1).await?;
            held[resource_type as usize] -= 1;
        }
        Ok(())
    }
}

async fn release_everything(handle: &WorkerHandle, held: &mut [u32]) -> Result<(), Error> {
    for (resource_type, count) in held.iter_mut().enumerate() {
        while *count > 0 {
            handle.release(resource_type as u8, 1).await?;
            *count -= 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proctable::WorkerId;
    use transport::ManagerTransport;

    use super::*;

    #[tokio::test]
    async fn supervisor_reaps_a_worker_that_terminates_immediately() {
        let mut transport = ManagerTransport::new(transport::MIN_CAPACITY);
        let worker_id = WorkerId(1);
        let transport_handle = transport.register(worker_id);

        // A minimal stand-in manager: grant every request immediately, so the
        // worker never blocks waiting for a notification that nobody sends.
        let drain = tokio::spawn(async move {
            loop {
                if let Some(message) = transport.try_recv() {
                    if let transport::MessageKind::Request { resource_type, count } = message.kind {
                        let _ = transport.notify(message.sender, Notification::Granted { resource_type, count });
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let mut supervisor = WorkerSupervisor::new();
        let behavior = Box::new(SimWorker {
            resource_count: 2,
            min_lifespan: Duration::ZERO,
        });
        supervisor.spawn(worker_id, behavior, transport_handle, CancellationToken::new());

        // Give the task a chance to roll its termination check and exit.
        for _ in 0..200 {
            if !supervisor.reap().await.is_empty() {
                drain.abort();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drain.abort();
        panic!("worker never reaped within the deadline");
    }

    #[tokio::test]
    async fn kill_aborts_a_registered_worker() {
        let mut transport = ManagerTransport::new(transport::MIN_CAPACITY);
        let worker_id = WorkerId(7);
        let transport_handle = transport.register(worker_id);

        let mut supervisor = WorkerSupervisor::new();
        let behavior = Box::new(SimWorker {
            resource_count: 2,
            min_lifespan: Duration::from_secs(3600),
        });
        supervisor.spawn(worker_id, behavior, transport_handle, CancellationToken::new());
        assert_eq!(supervisor.len(), 1);

        supervisor.kill(worker_id);
        assert_eq!(supervisor.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_token_causes_prompt_release_and_exit() {
        let mut transport = ManagerTransport::new(transport::MIN_CAPACITY);
        let worker_id = WorkerId(3);
        let transport_handle = transport.register(worker_id);
        let shutdown = CancellationToken::new();

        let mut supervisor = WorkerSupervisor::new();
        let behavior = Box::new(SimWorker {
            resource_count: 2,
            min_lifespan: Duration::from_secs(3600),
        });
        supervisor.spawn(worker_id, behavior, transport_handle, shutdown.clone());
        shutdown.cancel();

        for _ in 0..200 {
            if !supervisor.reap().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker never reaped after shutdown was requested");
    }
}
