use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use tokio::sync::{oneshot, watch};

use super::Command;
use crate::error::CommandError;

/// A successful exchange with the drone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// The reply text, usually `ok`. Empty for commands the drone does not
    /// answer.
    pub reply: String,
    /// How many times the command was sent before it was acknowledged.
    pub attempts: u32,
}

pub type CommandResult = Result<Ack, CommandError>;

/// A queued command and the slot its outcome is delivered to.
///
/// The request is consumed by [`CommandRequest::resolve`], so an outcome can
/// only be delivered once. A request that is dropped unresolved shows up as
/// [`CommandError::Cancelled`] on its handle.
#[derive(Debug)]
pub struct CommandRequest {
    pub seq: u64,
    pub command: Command,
    ret_tx: oneshot::Sender<CommandResult>,
    _pending: PendingGuard,
}

impl CommandRequest {
    pub fn resolve(self, result: CommandResult) {
        match &result {
            Ok(_) => trace!("command #{} ({}) succeeded", self.seq, self.command),
            Err(err) => debug!("command #{} ({}) failed: {}", self.seq, self.command, err),
        }

        // the caller may have dropped its handle, which is fine
        let _ = self.ret_tx.send(result);
    }
}

/// The caller's view of a queued command. Await it to get the outcome.
#[derive(Debug)]
pub struct CommandHandle {
    seq: u64,
    rx: oneshot::Receiver<CommandResult>,
}

impl CommandHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Future for CommandHandle {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(CommandError::Cancelled)))
    }
}

/// Counts commands that have been enqueued but not yet resolved.
#[derive(Debug, Clone)]
pub struct PendingTracker(Arc<watch::Sender<usize>>);

impl PendingTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        PendingTracker(Arc::new(tx))
    }

    fn acquire(&self) -> PendingGuard {
        self.0.send_modify(|n| *n += 1);
        PendingGuard(self.0.clone())
    }

    pub fn count(&self) -> usize {
        *self.0.borrow()
    }

    /// Resolves once no command is pending.
    pub async fn idle(&self) {
        let mut rx = self.0.subscribe();

        // the sender lives in self, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct PendingGuard(Arc<watch::Sender<usize>>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// The producer side of the command queue. Cloned into every caller that
/// issues commands; the dispatcher owns the receiving side.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    queue_tx: flume::Sender<CommandRequest>,
    emergency_tx: flume::Sender<CommandRequest>,
    next_seq: Arc<AtomicU64>,
    pending: PendingTracker,
}

/// The receiving ends handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct CommandSource {
    pub queue_rx: flume::Receiver<CommandRequest>,
    pub emergency_rx: flume::Receiver<CommandRequest>,
}

impl CommandSource {
    /// Removes every queued (not in-flight) request and resolves it.
    pub fn flush(&self, result: impl Fn() -> CommandResult) -> usize {
        let mut flushed = 0;

        for request in self.queue_rx.drain().chain(self.emergency_rx.drain()) {
            request.resolve(result());
            flushed += 1;
        }

        flushed
    }
}

pub fn command_queue() -> (CommandQueue, CommandSource) {
    let (queue_tx, queue_rx) = flume::unbounded();
    let (emergency_tx, emergency_rx) = flume::unbounded();

    (
        CommandQueue {
            queue_tx,
            emergency_tx,
            next_seq: Arc::new(AtomicU64::new(0)),
            pending: PendingTracker::new(),
        },
        CommandSource {
            queue_rx,
            emergency_rx,
        },
    )
}

impl CommandQueue {
    /// Validates the command and queues it. Returns without waiting for the
    /// drone; the handle resolves once the dispatcher is done with it.
    /// Emergency commands skip the queue.
    pub fn enqueue(&self, command: Command) -> Result<CommandHandle, CommandError> {
        command.validate()?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (ret_tx, rx) = oneshot::channel();
        let emergency = command.is_emergency();

        let request = CommandRequest {
            seq,
            command,
            ret_tx,
            _pending: self.pending.acquire(),
        };

        let tx = if emergency {
            &self.emergency_tx
        } else {
            &self.queue_tx
        };

        if let Err(flume::SendError(request)) = tx.send(request) {
            request.resolve(Err(CommandError::Cancelled));
        }

        Ok(CommandHandle { seq, rx })
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Axis;

    #[tokio::test]
    async fn invalid_command_is_not_queued() {
        let (queue, source) = command_queue();

        let err = queue
            .enqueue(Command::Move {
                axis: Axis::Up,
                distance: 5,
            })
            .unwrap_err();

        assert!(matches!(err, CommandError::Validation(_)));
        assert!(source.queue_rx.is_empty());
        assert_eq!(queue.pending().count(), 0);
    }

    #[tokio::test]
    async fn sequence_ids_are_monotonic() {
        let (queue, source) = command_queue();

        let a = queue.enqueue(Command::Takeoff).unwrap();
        let b = queue.enqueue(Command::Land).unwrap();
        let c = queue.enqueue(Command::Emergency).unwrap();

        assert!(a.seq() < b.seq() && b.seq() < c.seq());
        assert_eq!(source.queue_rx.len(), 2);
        assert_eq!(source.emergency_rx.len(), 1);
        assert_eq!(queue.pending().count(), 3);
    }

    #[tokio::test]
    async fn resolving_releases_pending_count() {
        let (queue, source) = command_queue();

        let handle = queue.enqueue(Command::Takeoff).unwrap();
        let request = source.queue_rx.try_recv().unwrap();
        request.resolve(Ok(Ack {
            reply: "ok".into(),
            attempts: 1,
        }));

        assert_eq!(handle.await.unwrap().reply, "ok");
        queue.pending().idle().await;
        assert_eq!(queue.pending().count(), 0);
    }

    #[tokio::test]
    async fn dropped_request_reads_as_cancelled() {
        let (queue, source) = command_queue();

        let pending = queue.pending().clone();
        let handle = queue.enqueue(Command::Land).unwrap();
        drop(queue);
        drop(source);

        assert_eq!(handle.await, Err(CommandError::Cancelled));
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn flush_resolves_everything_queued() {
        let (queue, source) = command_queue();

        let handles: Vec<_> = (0..4)
            .map(|_| queue.enqueue(Command::Takeoff).unwrap())
            .collect();

        assert_eq!(source.flush(|| Err(CommandError::Superseded)), 4);

        for handle in handles {
            assert_eq!(handle.await, Err(CommandError::Superseded));
        }
    }
}
