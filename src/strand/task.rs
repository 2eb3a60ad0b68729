//! Units of work scheduled on a strand, and the handles callers await.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::strand::{WeakStrand, Withdraw};
use crate::error::{Error, Result};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Event,
    Connection,
    Reader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// State cell shared by a queued task and its handle.
///
/// Transitions only move forward: Queued -> Running -> finished, or
/// Queued -> Cancelled.
#[derive(Debug)]
pub(crate) struct TaskStatus(AtomicU8);

impl TaskStatus {
    fn new() -> Self {
        Self(AtomicU8::new(TaskState::Queued as u8))
    }

    pub(crate) fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What a running task can see of its surroundings.
pub struct TaskContext<T> {
    id: TaskId,
    token: CancellationToken,
    data: Arc<T>,
    strand: WeakStrand<T>,
}

impl<T> Clone for TaskContext<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            token: self.token.clone(),
            data: Arc::clone(&self.data),
            strand: self.strand.clone(),
        }
    }
}

impl<T> TaskContext<T> {
    pub(crate) fn new(id: TaskId, token: CancellationToken, data: Arc<T>, strand: WeakStrand<T>) -> Self {
        Self {
            id,
            token,
            data,
            strand,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Payload of the strand the task runs on.
    pub fn data(&self) -> &Arc<T> {
        &self.data
    }

    /// Non-owning reference to the strand, for queueing follow-up work.
    pub fn strand(&self) -> &WeakStrand<T> {
        &self.strand
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A unit of asynchronous work.
///
/// `run` is awaited at most once. A stop request while running arrives
/// through [`TaskContext::cancelled`] and must be honored at the task's
/// next I/O wait; `cancel` is only called for a task withdrawn before it
/// started.
#[async_trait]
pub trait Task<T: Send + Sync + 'static>: Send + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> TaskKind;

    async fn run(&mut self, ctx: &TaskContext<T>) -> Result<Self::Output>;

    fn cancel(&mut self) {}

    fn on_complete(&mut self, _state: TaskState) {}
}

/// A task made from a closure.
pub struct EventTask<F> {
    f: Option<F>,
}

impl<F> EventTask<F> {
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> fmt::Debug for EventTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTask")
            .field("pending", &self.f.is_some())
            .finish()
    }
}

#[async_trait]
impl<T, F, Fut, R> Task<T> for EventTask<F>
where
    T: Send + Sync + 'static,
    F: FnOnce(TaskContext<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn kind(&self) -> TaskKind {
        TaskKind::Event
    }

    async fn run(&mut self, ctx: &TaskContext<T>) -> Result<R> {
        let f = self
            .f
            .take()
            .ok_or_else(|| Error::Programming("event task started twice".into()))?;
        f(ctx.clone()).await
    }
}

/// Type-erased queued task, as held by a strand.
pub(crate) trait Job<T>: Send {
    fn id(&self) -> TaskId;

    fn token(&self) -> &CancellationToken;

    fn run(self: Box<Self>, ctx: TaskContext<T>) -> BoxFuture<'static, ()>;

    /// Resolve as cancelled without running.
    fn withdraw(self: Box<Self>);
}

pub(crate) struct Slot<T, K: Task<T>>
where
    T: Send + Sync + 'static,
{
    id: TaskId,
    task: K,
    token: CancellationToken,
    status: Arc<TaskStatus>,
    tx: oneshot::Sender<Result<K::Output>>,
    _strand: PhantomData<fn(T)>,
}

/// Build a queued task and the handle that observes it.
pub(crate) fn slot<T, K>(
    id: TaskId,
    task: K,
    strand: Weak<dyn Withdraw>,
) -> (Box<dyn Job<T>>, TaskHandle<K::Output>)
where
    T: Send + Sync + 'static,
    K: Task<T>,
{
    let (tx, rx) = oneshot::channel();
    let token = CancellationToken::new();
    let status = Arc::new(TaskStatus::new());
    let handle = TaskHandle {
        id,
        kind: task.kind(),
        status: Arc::clone(&status),
        token: token.clone(),
        strand,
        rx,
    };
    let job = Slot {
        id,
        task,
        token,
        status,
        tx,
        _strand: PhantomData,
    };
    (Box::new(job), handle)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<T, K> Job<T> for Slot<T, K>
where
    T: Send + Sync + 'static,
    K: Task<T>,
{
    fn id(&self) -> TaskId {
        self.id
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn run(self: Box<Self>, ctx: TaskContext<T>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut this = *self;
            if this.token.is_cancelled() || !this.status.advance(TaskState::Queued, TaskState::Running) {
                Box::new(this).withdraw();
                return;
            }
            tracing::trace!(task = this.id, kind = ?this.task.kind(), "task started");

            let outcome = AssertUnwindSafe(this.task.run(&ctx)).catch_unwind().await;
            let result = match outcome {
                Ok(result) => result,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    tracing::error!(task = this.id, panic = %msg, "task panicked");
                    Err(Error::Panicked(msg))
                }
            };

            let state = match &result {
                Ok(_) => TaskState::Completed,
                Err(Error::Cancelled) => TaskState::Cancelled,
                Err(_) => TaskState::Failed,
            };
            this.status.advance(TaskState::Running, state);
            let task = &mut this.task;
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| task.on_complete(state))) {
                tracing::error!(task = this.id, panic = %panic_message(payload.as_ref()), "completion hook panicked");
            }
            tracing::trace!(task = this.id, ?state, "task finished");
            // The caller may have dropped its handle
            let _ = this.tx.send(result);
        })
    }

    fn withdraw(self: Box<Self>) {
        let mut this = *self;
        this.status.advance(TaskState::Queued, TaskState::Cancelled);
        this.task.cancel();
        tracing::trace!(task = this.id, "task withdrawn");
        let _ = this.tx.send(Err(Error::Cancelled));
    }
}

/// Awaitable completion of one task.
///
/// Resolves exactly once with the task's result, or with
/// [`Error::Cancelled`] if the task was withdrawn or its strand went away.
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<R> {
    id: TaskId,
    kind: TaskKind,
    status: Arc<TaskStatus>,
    token: CancellationToken,
    strand: Weak<dyn Withdraw>,
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> TaskHandle<R> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn state(&self) -> TaskState {
        self.status.get()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Withdraw the task if it has not started, otherwise ask it to stop.
    ///
    /// Returns false when the task had already finished.
    pub fn cancel(&self) -> bool {
        if let Some(strand) = self.strand.upgrade() {
            if strand.withdraw(self.id) {
                return true;
            }
        }
        if self.status.get().is_finished() {
            return false;
        }
        self.token.cancel();
        true
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Dropped unresolved: the runtime shut down under the task
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
