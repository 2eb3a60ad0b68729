//! Strand-based task scheduling.
//!
//! - `queue`: the runtime binding that strand runners execute on
//! - `strand`: FIFO queues that run one task at a time
//! - `task`: the task interface, closure tasks and completion handles

mod queue;
#[allow(clippy::module_inception)]
mod strand;
mod task;

pub use queue::EventQueue;
pub use strand::{Strand, WeakStrand};
pub use task::{EventTask, Task, TaskContext, TaskHandle, TaskId, TaskKind, TaskState};
