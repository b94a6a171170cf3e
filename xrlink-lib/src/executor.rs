//! Serial command execution with response correlation.
//!
//! One worker task per session pops commands in FIFO order, writes each one
//! and waits for [`CommandExecutor::signal_response`] or the timeout before
//! starting the next. At most one command is ever in flight.

use crate::command::{Command, CommandContext};
use crate::error::{Result, XrError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Where the executor writes command payloads.
#[async_trait::async_trait]
pub trait CommandWriter: Send + Sync + 'static {
    async fn write_command(&self, payload: Bytes) -> Result<()>;

    fn context(&self) -> CommandContext;
}

/// Type-erased queued command.
trait Job: Send {
    fn name(&self) -> &'static str;
    fn payload(&self, ctx: &CommandContext) -> Result<Bytes>;
    fn complete(self: Box<Self>, outcome: Result<Bytes>);
}

struct TypedJob<C: Command> {
    command: C,
    tx: oneshot::Sender<Result<C::Output>>,
}

impl<C: Command> Job for TypedJob<C> {
    fn name(&self) -> &'static str {
        self.command.name()
    }

    fn payload(&self, ctx: &CommandContext) -> Result<Bytes> {
        self.command.payload(ctx)
    }

    fn complete(self: Box<Self>, outcome: Result<Bytes>) {
        let result = outcome.and_then(|response| self.command.parse(&response));
        // Caller may have stopped waiting.
        let _ = self.tx.send(result);
    }
}

/// Completion of an enqueued command. Resolves to `Cancelled` if the command
/// was dropped from the queue before it ran.
#[must_use = "the command still runs, but its result is lost"]
pub struct PendingCommand<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for PendingCommand<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(XrError::Cancelled)))
    }
}

type ResponseSlot = Option<oneshot::Sender<Result<Bytes>>>;

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Box<dyn Job>>>,
    pending: Mutex<ResponseSlot>,
    notify: Notify,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Box<dyn Job>>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, ResponseSlot> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct CommandExecutor {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl CommandExecutor {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(writer: Arc<dyn CommandWriter>, timeout: Duration) -> Self {
        let shared = Arc::new(Shared::default());
        let worker = tokio::spawn(Self::run(shared.clone(), writer, timeout));
        Self { shared, worker }
    }

    /// Appends to the queue; never blocks.
    pub fn enqueue<C: Command>(&self, command: C) -> PendingCommand<C::Output> {
        let (tx, rx) = oneshot::channel();
        trace!(command = command.name(), "enqueue");
        self.shared.queue().push_back(Box::new(TypedJob { command, tx }));
        self.shared.notify.notify_one();
        PendingCommand { rx }
    }

    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        self.enqueue(command).await
    }

    /// Completes the in-flight command with `response`. Returns false when
    /// nothing was waiting.
    pub fn signal_response(&self, response: Bytes) -> bool {
        match self.shared.pending().take() {
            Some(slot) => slot.send(Ok(response)).is_ok(),
            None => {
                trace!("response with no pending command");
                false
            }
        }
    }

    /// Fails the in-flight command, if any, with `error`.
    pub fn abort_pending(&self, error: XrError) -> bool {
        match self.shared.pending().take() {
            Some(slot) => slot.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Drops every queued command that has not started. The in-flight one is untouched.
    pub fn clear(&self) -> usize {
        let dropped: Vec<_> = self.shared.queue().drain(..).collect();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "cleared queued commands");
        }
        dropped.len()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.pending().is_some()
    }

    async fn run(shared: Arc<Shared>, writer: Arc<dyn CommandWriter>, timeout: Duration) {
        loop {
            let next = shared.queue().pop_front();
            let Some(job) = next else {
                shared.notify.notified().await;
                continue;
            };
            Self::execute_one(&shared, writer.as_ref(), job, timeout).await;
        }
    }

    async fn execute_one(shared: &Shared, writer: &dyn CommandWriter, job: Box<dyn Job>, timeout: Duration) {
        let name = job.name();
        let payload = match job.payload(&writer.context()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(command = name, error = %e, "failed to build payload");
                job.complete(Err(e));
                return;
            }
        };

        let (tx, rx) = oneshot::channel();
        *shared.pending() = Some(tx);

        debug!(command = name, bytes = %hex::encode(&payload), "execute");
        if let Err(e) = writer.write_command(payload).await {
            shared.pending().take();
            warn!(command = name, error = %e, "write failed");
            job.complete(Err(e));
            return;
        }

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(XrError::LinkClosed),
            Err(_) => {
                shared.pending().take();
                warn!(command = name, ?timeout, "command timed out");
                Err(XrError::CommandTimeout { command: name, timeout })
            }
        };
        job.complete(outcome);
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{GetBrightness, RawCommand};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct ChannelWriter {
        tx: mpsc::UnboundedSender<(Instant, Bytes)>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CommandWriter for ChannelWriter {
        async fn write_command(&self, payload: Bytes) -> Result<()> {
            if self.fail {
                return Err(XrError::Transport("radio off".to_string()));
            }
            let _ = self.tx.send((Instant::now(), payload));
            Ok(())
        }

        fn context(&self) -> CommandContext {
            CommandContext { mtu: 23 }
        }
    }

    fn executor(fail: bool) -> (CommandExecutor, mpsc::UnboundedReceiver<(Instant, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Arc::new(ChannelWriter { tx, fail });
        (CommandExecutor::spawn(writer, Duration::from_millis(300)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_completes_and_releases_next() {
        let (exec, mut writes) = executor(false);
        let first = exec.enqueue(GetBrightness);
        let second = exec.enqueue(RawCommand::new("second", vec![0x45, 0x4D, 0x01]));

        let (_, frame) = writes.recv().await.unwrap();
        assert_eq!(hex::encode(&frame), "454d220000000000");
        assert!(exec.signal_response(Bytes::from_static(&[0x4F, 0x42, 0x22, 0, 2, 0, 4, 0, 0, 55])));
        assert_eq!(first.await.unwrap(), 55);

        let (_, frame) = writes.recv().await.unwrap();
        assert_eq!(frame.as_ref(), &[0x45, 0x4D, 0x01]);
        assert!(exec.signal_response(Bytes::from_static(&[0x4F, 0x42])));
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_in_submission_order() {
        let (exec, mut writes) = executor(false);
        let start = Instant::now();
        let pending: Vec<_> = (0..3)
            .map(|_| exec.enqueue(RawCommand::new("silent", vec![0x45, 0x4D])))
            .collect();

        let mut write_times = Vec::new();
        for (i, p) in pending.into_iter().enumerate() {
            let err = p.await.unwrap_err();
            assert!(matches!(err, XrError::CommandTimeout { command: "silent", .. }));
            assert!(start.elapsed() >= Duration::from_millis(300 * (i as u64 + 1)));
            write_times.push(writes.recv().await.unwrap().0);
        }
        for pair in write_times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_queued_only() {
        let (exec, mut writes) = executor(false);
        let running = exec.enqueue(RawCommand::new("running", vec![1]));
        writes.recv().await.unwrap();
        let queued = exec.enqueue(RawCommand::new("queued", vec![2]));

        assert_eq!(exec.clear(), 1);
        assert!(matches!(queued.await, Err(XrError::Cancelled)));
        assert!(exec.is_busy());
        assert!(exec.signal_response(Bytes::from_static(&[0x4F, 0x42])));
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_pending_fails_in_flight() {
        let (exec, mut writes) = executor(false);
        let running = exec.enqueue(RawCommand::new("running", vec![1]));
        writes.recv().await.unwrap();
        assert!(exec.abort_pending(XrError::LinkClosed));
        assert!(matches!(running.await, Err(XrError::LinkClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_completes_with_error() {
        let (exec, _writes) = executor(true);
        let err = exec.execute(RawCommand::new("doomed", vec![1])).await.unwrap_err();
        assert!(err.is_transport());
        assert!(!exec.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_failure_reported_to_caller() {
        let (exec, mut writes) = executor(false);
        let pending = exec.enqueue(GetBrightness);
        writes.recv().await.unwrap();
        exec.signal_response(Bytes::from_static(&[0x4F, 0x42, 0x22]));
        assert!(matches!(pending.await, Err(XrError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_signal_without_pending_is_ignored() {
        let (exec, _writes) = executor(false);
        assert!(!exec.signal_response(Bytes::from_static(&[0x4F, 0x42])));
    }
}
