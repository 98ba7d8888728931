//! The unit of work executed by a runner.

use crate::error::TaskError;
use crate::tasks::context::TaskContext;

/// Status returned by a task pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is done.
    Complete,
    /// Run this same task again for another pass.
    Continue,
}

/// User-supplied background work.
///
/// `run` executes on a runner thread and reports through `ctx`. Long-running
/// work should call [`TaskContext::checkpoint`] (or wait with
/// [`TaskContext::sleep`]) at safe points so cancellation takes effect;
/// a task that never checks runs to completion.
pub trait Task: Send + 'static {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskStatus, TaskError>;

    /// Human-readable description used in logs and snapshots.
    fn description(&self) -> String {
        "Background task".to_string()
    }
}

impl<F> Task for F
where
    F: FnMut(&TaskContext) -> Result<TaskStatus, TaskError> + Send + 'static,
{
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskStatus, TaskError> {
        self(ctx)
    }
}

/// A closure task with a description.
pub struct FnTask<F> {
    description: String,
    f: F,
}

impl<F> FnTask<F>
where
    F: FnMut(&TaskContext) -> Result<TaskStatus, TaskError> + Send + 'static,
{
    pub fn new(description: impl Into<String>, f: F) -> Self {
        Self {
            description: description.into(),
            f,
        }
    }
}

impl<F> Task for FnTask<F>
where
    F: FnMut(&TaskContext) -> Result<TaskStatus, TaskError> + Send + 'static,
{
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskStatus, TaskError> {
        (self.f)(ctx)
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}
