//! Ordered single-consumer task queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::queue::EventQueue;
use super::task::{slot, Job, Task, TaskContext, TaskHandle, TaskId};

/// Something a [`TaskHandle`] can ask to withdraw its task.
pub(crate) trait Withdraw: Send + Sync {
    /// Withdraw a queued task, or signal the running one. False if the id is unknown here.
    fn withdraw(&self, id: TaskId) -> bool;
}

/// A handle target that never knows any task.
pub(crate) fn no_strand() -> Weak<dyn Withdraw> {
    Weak::<StrandInner<()>>::new()
}

struct Pending<T> {
    jobs: VecDeque<Box<dyn Job<T>>>,
    running: Option<(TaskId, CancellationToken)>,
    /// A runner is scheduled or executing
    active: bool,
    closed: bool,
}

pub(crate) struct StrandInner<T> {
    data: Arc<T>,
    queue: EventQueue,
    pending: Mutex<Pending<T>>,
}

impl<T: Send + Sync + 'static> StrandInner<T> {
    fn submit<K: Task<T>>(self: &Arc<Self>, task: K, front: bool) -> TaskHandle<K::Output> {
        let id = self.queue.next_task_id();
        let target: Weak<dyn Withdraw> = Arc::downgrade(self) as Weak<dyn Withdraw>;
        let (job, handle) = slot::<T, K>(id, task, target);

        let start = {
            let mut pending = self.pending.lock();
            if pending.closed {
                drop(pending);
                job.withdraw();
                return handle;
            }
            if front {
                pending.jobs.push_front(job);
            } else {
                pending.jobs.push_back(job);
            }
            !std::mem::replace(&mut pending.active, true)
        };

        tracing::trace!(task = id, front, "task queued");
        if start {
            self.queue.spawn_runner(Arc::clone(self).drive());
        }
        handle
    }

    /// Run queued jobs one at a time until the queue is empty.
    async fn drive(self: Arc<Self>) {
        loop {
            let job = {
                let mut pending = self.pending.lock();
                match pending.jobs.pop_front() {
                    Some(job) => {
                        pending.running = Some((job.id(), job.token().clone()));
                        job
                    }
                    None => {
                        pending.running = None;
                        pending.active = false;
                        return;
                    }
                }
            };

            let ctx = TaskContext::new(
                job.id(),
                job.token().clone(),
                Arc::clone(&self.data),
                WeakStrand {
                    inner: Arc::downgrade(&self),
                },
            );
            job.run(ctx).await;
        }
    }

    fn close(&self) {
        let withdrawn: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            if let Some((_, token)) = &pending.running {
                token.cancel();
            }
            pending.jobs.drain(..).collect()
        };
        if !withdrawn.is_empty() {
            tracing::debug!(count = withdrawn.len(), "strand closed with pending tasks");
        }
        for job in withdrawn {
            job.withdraw();
        }
    }
}

impl<T: Send + Sync + 'static> Withdraw for StrandInner<T> {
    fn withdraw(&self, id: TaskId) -> bool {
        let job = {
            let mut pending = self.pending.lock();
            match pending.jobs.iter().position(|job| job.id() == id) {
                Some(pos) => pending.jobs.remove(pos),
                None => {
                    return match &pending.running {
                        Some((running, token)) if *running == id => {
                            token.cancel();
                            true
                        }
                        _ => false,
                    };
                }
            }
        };
        if let Some(job) = job {
            job.withdraw();
        }
        true
    }
}

/// FIFO of tasks that execute one at a time, in submission order.
///
/// The `Strand` value owns the queue: dropping it withdraws every pending
/// task and asks the running one to stop. Tasks only ever hold a
/// [`WeakStrand`].
pub struct Strand<T: Send + Sync + 'static> {
    inner: Arc<StrandInner<T>>,
}

impl<T: Send + Sync + 'static> Strand<T> {
    pub(crate) fn new(queue: EventQueue, data: T) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                data: Arc::new(data),
                queue,
                pending: Mutex::new(Pending {
                    jobs: VecDeque::new(),
                    running: None,
                    active: false,
                    closed: false,
                }),
            }),
        }
    }

    /// Append a task. It starts at once if the strand is idle.
    pub fn enqueue<K: Task<T>>(&self, task: K) -> TaskHandle<K::Output> {
        self.inner.submit(task, false)
    }

    /// Place a task ahead of everything still queued.
    pub fn push_front<K: Task<T>>(&self, task: K) -> TaskHandle<K::Output> {
        self.inner.submit(task, true)
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.inner.withdraw(id)
    }

    /// Tasks waiting to run, not counting the running one.
    pub fn len(&self) -> usize {
        self.inner.pending.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        let pending = self.inner.pending.lock();
        !pending.active && pending.jobs.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed
    }

    pub fn data(&self) -> &Arc<T> {
        &self.inner.data
    }

    pub fn downgrade(&self) -> WeakStrand<T> {
        WeakStrand {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Withdraw pending tasks and refuse new ones. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<T: Send + Sync + 'static> Drop for Strand<T> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Strand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.pending.lock();
        f.debug_struct("Strand")
            .field("pending", &pending.jobs.len())
            .field("running", &pending.running.as_ref().map(|(id, _)| *id))
            .field("closed", &pending.closed)
            .finish()
    }
}

/// Non-owning reference to a strand.
pub struct WeakStrand<T> {
    inner: Weak<StrandInner<T>>,
}

impl<T> Clone for WeakStrand<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> WeakStrand<T> {
    /// A reference to no strand at all.
    pub(crate) fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    fn open(&self) -> Option<Arc<StrandInner<T>>> {
        self.inner
            .upgrade()
            .filter(|inner| !inner.pending.lock().closed)
    }

    /// Append a task if the strand still exists and is open.
    pub fn enqueue<K: Task<T>>(&self, task: K) -> Option<TaskHandle<K::Output>> {
        self.open().map(|inner| inner.submit(task, false))
    }

    pub fn push_front<K: Task<T>>(&self, task: K) -> Option<TaskHandle<K::Output>> {
        self.open().map(|inner| inner.submit(task, true))
    }

    pub fn is_alive(&self) -> bool {
        self.open().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::error::{Error, Result};
    use crate::strand::task::{EventTask, TaskState};

    fn strand() -> Strand<Mutex<Vec<usize>>> {
        EventQueue::current().unwrap().new_strand(Mutex::new(Vec::new()))
    }

    type Ctx = TaskContext<Mutex<Vec<usize>>>;

    #[tokio::test]
    async fn test_fifo_and_exclusive() {
        let strand = strand();
        let running = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..20 {
            let running = Arc::clone(&running);
            handles.push(strand.enqueue(EventTask::new(move |ctx: Ctx| async move {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                ctx.data().lock().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            })));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
        assert_eq!(*strand.data().lock(), (0..20).collect::<Vec<_>>());
        assert!(strand.is_idle());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_tasks() {
        let strand = strand();
        let a = strand.enqueue(EventTask::new(|_ctx: Ctx| async {
            Err::<(), _>(Error::Programming("first".into()))
        }));
        let b = strand.enqueue(EventTask::new(|_ctx: Ctx| async {
            if true {
                panic!("second");
            }
            Ok(())
        }));
        let c = strand.enqueue(EventTask::new(|_ctx: Ctx| async { Ok(3) }));
        assert!(a.await.is_err());
        assert!(matches!(b.await, Err(Error::Panicked(_))));
        assert_eq!(c.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancel_queued_keeps_order() {
        let strand = strand();
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        let first = strand.enqueue(EventTask::new(move |ctx: Ctx| async move {
            g.notified().await;
            ctx.data().lock().push(0);
            Ok(())
        }));
        let handles: Vec<_> = (1..5)
            .map(|i| {
                strand.enqueue(EventTask::new(move |ctx: Ctx| async move {
                    ctx.data().lock().push(i);
                    Ok(())
                }))
            })
            .collect();
        while first.state() != TaskState::Running {
            tokio::task::yield_now().await;
        }
        assert_eq!(strand.len(), 4);

        assert!(handles[1].cancel());
        assert_eq!(handles[1].state(), TaskState::Cancelled);
        assert_eq!(strand.len(), 3);
        gate.notify_one();

        first.await.unwrap();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.is_ok());
        }
        assert_eq!(results, vec![true, false, true, true]);
        assert_eq!(*strand.data().lock(), vec![0, 1, 3, 4]);
    }

    #[tokio::test]
    async fn test_cancel_running_is_cooperative() {
        let strand = strand();
        let handle = strand.enqueue(EventTask::new(|ctx: Ctx| async move {
            ctx.cancelled().await;
            Err::<(), _>(Error::Cancelled)
        }));
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), TaskState::Running);
        assert!(strand.cancel(handle.id()));
        assert!(matches!(handle.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_push_front_jumps_the_queue() {
        let strand = strand();
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        let first = strand.enqueue(EventTask::new(move |_ctx: Ctx| async move {
            g.notified().await;
            Ok(())
        }));
        let later = strand.enqueue(EventTask::new(|ctx: Ctx| async move {
            ctx.data().lock().push(2);
            Ok(())
        }));
        let urgent = strand.push_front(EventTask::new(|ctx: Ctx| async move {
            ctx.data().lock().push(1);
            Ok(())
        }));
        gate.notify_one();
        first.await.unwrap();
        urgent.await.unwrap();
        later.await.unwrap();
        assert_eq!(*strand.data().lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drop_withdraws_pending() {
        let strand = strand();
        let running = strand.enqueue(EventTask::new(|ctx: Ctx| async move {
            ctx.cancelled().await;
            Err::<(), _>(Error::Cancelled)
        }));
        let queued = strand.enqueue(EventTask::new(|_ctx: Ctx| async { Ok(()) }));
        tokio::task::yield_now().await;
        drop(strand);
        assert!(matches!(queued.await, Err(Error::Cancelled)));
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(1), running).await,
            Ok(Err(Error::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_self_requeue_through_weak_reference() {
        let strand = strand();
        let handle = strand.enqueue(EventTask::new(|ctx: Ctx| async move {
            ctx.data().lock().push(1);
            let follow_up = ctx
                .strand()
                .enqueue(EventTask::new(|ctx: Ctx| async move {
                    ctx.data().lock().push(2);
                    Ok(())
                }))
                .ok_or(Error::Cancelled)?;
            Ok::<_, Error>(follow_up)
        }));
        let follow_up = handle.await.unwrap();
        follow_up.await.unwrap();
        assert_eq!(*strand.data().lock(), vec![1, 2]);

        let weak = strand.downgrade();
        drop(strand);
        assert!(!weak.is_alive());
        assert!(weak
            .enqueue(EventTask::new(|_ctx: Ctx| async { Ok::<_, Error>(()) }))
            .is_none());
    }

    #[tokio::test]
    async fn test_closed_strand_rejects_new_tasks() {
        let strand = strand();
        strand.close();
        let handle = strand.enqueue(EventTask::new(|_ctx: Ctx| async { Result::Ok(1) }));
        assert!(matches!(handle.await, Err(Error::Cancelled)));
        assert!(strand.is_closed());
    }
}
