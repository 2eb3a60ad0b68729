use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;

use super::strand::{no_strand, Strand, WeakStrand};
use super::task::{slot, Task, TaskContext, TaskHandle, TaskId};
use crate::error::{Error, Result};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// The runtime that strand runners and unordered tasks execute on.
#[derive(Debug, Clone)]
pub struct EventQueue {
    handle: Handle,
}

impl EventQueue {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling task.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Config(format!("no tokio runtime: {}", e)))
    }

    pub fn new_strand<T: Send + Sync + 'static>(&self, data: T) -> Strand<T> {
        Strand::new(self.clone(), data)
    }

    /// Run a task with no ordering relative to any other task.
    pub fn spawn<K: Task<()>>(&self, task: K) -> TaskHandle<K::Output> {
        let id = self.next_task_id();
        let (job, handle) = slot::<(), K>(id, task, no_strand());
        let ctx = TaskContext::new(
            id,
            handle.token().clone(),
            std::sync::Arc::new(()),
            WeakStrand::detached(),
        );
        self.handle.spawn(job.run(ctx));
        handle
    }

    pub fn next_task_id(&self) -> TaskId {
        NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn spawn_runner<F>(&self, runner: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(runner);
    }
}
