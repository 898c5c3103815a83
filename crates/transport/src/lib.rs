#![deny(unsafe_code)]

//! The typed, addressable message transport between worker actors and the
//! manager.
//!
//! Grounded in the teacher's `signal` crate: a `flume` channel per
//! direction, with the manager's receive side always a non-blocking
//! `try_recv` (`spec.md` §4.E — the manager must never block on the
//! transport) and a dedicated unicast channel per worker for grant
//! notifications and the `Terminate` command.

use std::collections::HashMap;

use proctable::WorkerId;

/// Minimum in-flight message capacity the transport must support, per
/// `spec.md` §4.E.
pub const MIN_CAPACITY: usize = proctable::MAX_SIMULTANEOUS * 2;

/// Errors produced by the transport.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The manager has no outbox registered for this worker (it was never
    /// registered, or has already been deregistered).
    #[error("unknown worker {0:?}")]
    UnknownWorker(WorkerId),
    /// The worker's inbox was closed or full beyond retry.
    #[error("failed to notify worker {worker:?}: {reason}")]
    NotifyFailed {
        /// The worker that could not be notified.
        worker: WorkerId,
        /// The underlying transport error.
        reason: String,
    },
    /// The manager's shared inbox has been disconnected (all senders
    /// dropped).
    #[error("manager inbox disconnected")]
    InboxDisconnected,
}

/// A request/release/terminate message sent by a worker to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// The worker that produced this message.
    pub sender: WorkerId,
    /// What the worker is asking for.
    pub kind: MessageKind,
}

/// The three message kinds a worker can send, matching the wire-shapes of
/// `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Request `count` units of `resource_type`. `count` is always >= 1.
    Request {
        /// The resource type requested.
        resource_type: u8,
        /// Units requested; always >= 1.
        count: u32,
    },
    /// Release `count` units of `resource_type`. `count` is always >= 1.
    Release {
        /// The resource type released.
        resource_type: u8,
        /// Units released; always >= 1.
        count: u32,
    },
    /// The worker is exiting normally.
    Terminate,
}

/// A notification sent by the manager back to one worker: either a grant of
/// a previously blocked (or immediate) request, or an unconditional
/// terminate command issued by the deadlock resolver or a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// `count` units of `resource_type` have been granted.
    Granted {
        /// The resource type granted.
        resource_type: u8,
        /// Units granted.
        count: u32,
    },
    /// The worker must stop unconditionally. It must not explicitly release
    /// anything further — the manager already ran `release_all` on its
    /// behalf.
    Terminate,
}

/// The manager's side of the transport: one shared inbox for all workers,
/// and one outbox per registered worker.
pub struct ManagerTransport {
    inbox_tx: flume::Sender<Message>,
    inbox_rx: flume::Receiver<Message>,
    outboxes: HashMap<WorkerId, flume::Sender<Notification>>,
}

impl Default for ManagerTransport {
    fn default() -> Self {
        Self::new(MIN_CAPACITY)
    }
}

impl ManagerTransport {
    /// Creates a transport whose shared inbox holds at most `capacity`
    /// in-flight messages.
    pub fn new(capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = flume::bounded(capacity.max(MIN_CAPACITY));
        Self {
            inbox_tx,
            inbox_rx,
            outboxes: HashMap::new(),
        }
    }

    /// Registers `worker_id` and returns the handle it will use to talk to
    /// the manager.
    pub fn register(&mut self, worker_id: WorkerId) -> WorkerHandle {
        let (notify_tx, notify_rx) = flume::bounded(MIN_CAPACITY);
        let _ = self.outboxes.insert(worker_id, notify_tx);
        WorkerHandle {
            worker_id,
            to_manager: self.inbox_tx.clone(),
            from_manager: notify_rx,
        }
    }

    /// Drops the outbox for `worker_id`; further `notify` calls for it fail.
    pub fn deregister(&mut self, worker_id: WorkerId) {
        let _ = self.outboxes.remove(&worker_id);
    }

    /// Polls for the next message without blocking. The manager's main loop
    /// drains this in a loop each tick; it never awaits here.
    pub fn try_recv(&self) -> Option<Message> {
        self.inbox_rx.try_recv().ok()
    }

    /// Sends a notification to `worker_id`. Used for resource grants drained
    /// off a wait queue and for unconditional terminate commands.
    pub fn notify(&self, worker_id: WorkerId, notification: Notification) -> Result<(), Error> {
        let outbox = self.outboxes.get(&worker_id).ok_or(Error::UnknownWorker(worker_id))?;
        outbox.try_send(notification).map_err(|err| Error::NotifyFailed {
            worker: worker_id,
            reason: err.to_string(),
        })
    }
}

/// A worker's side of the transport.
pub struct WorkerHandle {
    worker_id: WorkerId,
    to_manager: flume::Sender<Message>,
    from_manager: flume::Receiver<Notification>,
}

impl WorkerHandle {
    /// This worker's identifier.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Sends a request for `count` units of `resource_type`. Blocks only if
    /// the shared inbox is momentarily full.
    pub async fn request(&self, resource_type: u8, count: u32) -> Result<(), Error> {
        self.send(MessageKind::Request { resource_type, count }).await
    }

    /// Sends a release of `count` units of `resource_type`.
    pub async fn release(&self, resource_type: u8, count: u32) -> Result<(), Error> {
        self.send(MessageKind::Release { resource_type, count }).await
    }

    /// Announces normal termination.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.send(MessageKind::Terminate).await
    }

    async fn send(&self, kind: MessageKind) -> Result<(), Error> {
        self.to_manager
            .send_async(Message {
                sender: self.worker_id,
                kind,
            })
            .await
            .map_err(|_| Error::InboxDisconnected)
    }

    /// Waits for the next notification from the manager (a grant or a
    /// terminate command).
    pub async fn recv(&self) -> Option<Notification> {
        self.from_manager.recv_async().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_from_one_sender_are_delivered_in_order() {
        let mut transport = ManagerTransport::new(MIN_CAPACITY);
        let handle = transport.register(WorkerId(1));

        handle.request(0, 1).await.unwrap();
        handle.request(0, 2).await.unwrap();
        handle.terminate().await.unwrap();

        let m1 = transport.try_recv().unwrap();
        let m2 = transport.try_recv().unwrap();
        let m3 = transport.try_recv().unwrap();
        assert!(transport.try_recv().is_none());

        assert_eq!(m1.kind, MessageKind::Request { resource_type: 0, count: 1 });
        assert_eq!(m2.kind, MessageKind::Request { resource_type: 0, count: 2 });
        assert_eq!(m3.kind, MessageKind::Terminate);
    }

    #[tokio::test]
    async fn notify_reaches_the_right_worker() {
        let mut transport = ManagerTransport::new(MIN_CAPACITY);
        let h1 = transport.register(WorkerId(1));
        let h2 = transport.register(WorkerId(2));

        transport
            .notify(WorkerId(2), Notification::Granted { resource_type: 0, count: 3 })
            .unwrap();

        let n2 = h2.recv().await.unwrap();
        assert_eq!(n2, Notification::Granted { resource_type: 0, count: 3 });

        // h1 has nothing queued.
        assert!(h1.from_manager.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_unknown_worker_is_an_error() {
        let transport = ManagerTransport::new(MIN_CAPACITY);
        let err = transport.notify(WorkerId(42), Notification::Terminate).unwrap_err();
        assert!(matches!(err, Error::UnknownWorker(WorkerId(42))));
    }

    #[tokio::test]
    async fn try_recv_never_blocks_when_empty() {
        let transport = ManagerTransport::new(MIN_CAPACITY);
        assert!(transport.try_recv().is_none());
    }
}
