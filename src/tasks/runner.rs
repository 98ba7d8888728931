//! Worker bound to one OS thread.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::TaskError;
use crate::tasks::context::TaskContext;
use crate::tasks::manager::Shared;
use crate::tasks::task::{Task, TaskStatus};

/// Identity of a runner within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerId(usize);

impl RunnerId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runner-{}", self.0)
    }
}

/// A submitted task paired with its context.
pub(crate) struct Job {
    pub(crate) task: Box<dyn Task>,
    pub(crate) context: TaskContext,
}

/// How one execution pass ended.
enum Pass {
    /// The task asked for another pass.
    Again(Job),
    /// The task is done; the result decides the terminal state.
    Done(TaskContext, Result<(), TaskError>),
}

/// Executes at most one task at a time on its own thread.
pub struct TaskRunner {
    id: RunnerId,
    current: Mutex<Option<TaskContext>>,
}

impl TaskRunner {
    /// Start the runner thread. Jobs sent on the returned channel run in order;
    /// dropping the sender stops the thread once the current job is done.
    pub(crate) fn spawn(
        id: RunnerId,
        thread_name: String,
        shared: Arc<Shared>,
    ) -> std::io::Result<(Arc<Self>, mpsc::UnboundedSender<Job>, JoinHandle<()>)> {
        let runner = Arc::new(Self {
            id,
            current: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let worker = Arc::clone(&runner);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                debug!(runner = %worker.id, "Runner started");
                while let Some(job) = rx.blocking_recv() {
                    worker.execute(job, &shared);
                }
                debug!(runner = %worker.id, "Runner stopped");
            })?;

        Ok((runner, tx, handle))
    }

    pub fn id(&self) -> RunnerId {
        self.id
    }

    /// Context of the task being executed right now.
    pub fn current_context(&self) -> Option<TaskContext> {
        self.current.lock().clone()
    }

    /// Run one pass, then report back to the manager. The runner is released
    /// before the terminal transition is published, so anyone who sees the
    /// context finished can already reuse the runner.
    fn execute(&self, job: Job, shared: &Shared) {
        match self.run(job, shared) {
            Pass::Again(job) => shared.release(self.id, Some(job)),
            Pass::Done(ctx, result) => {
                shared.release(self.id, None);
                match result {
                    Ok(()) => ctx.complete(),
                    Err(e) if e.is_interruption() => ctx.interrupted(e),
                    Err(e) => ctx.failed(e),
                };
            }
        }
    }

    fn run(&self, mut job: Job, shared: &Shared) -> Pass {
        let ctx = job.context.clone();
        if !ctx.start(self.id) {
            // Already finished; the terminal transition is ignored
            return Pass::Done(ctx, Err(TaskError::Interrupted));
        }
        // Published before the shutdown check so `Shared::shutdown` either
        // sees this context or this check sees the flag.
        *self.current.lock() = Some(ctx.clone());
        trace!(runner = %self.id, task_id = %ctx.id(), "Running task pass");

        let result = if shared.is_shut_down() {
            Err(TaskError::Shutdown)
        } else if ctx.is_cancel_requested() {
            Err(TaskError::Interrupted)
        } else {
            catch_unwind(AssertUnwindSafe(|| job.task.run(&ctx)))
                .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(&*payload))))
        };

        *self.current.lock() = None;

        match result {
            Ok(TaskStatus::Continue) if !ctx.is_cancel_requested() => {
                ctx.requeue();
                Pass::Again(job)
            }
            Ok(TaskStatus::Continue) => Pass::Done(ctx, Err(TaskError::Interrupted)),
            Ok(TaskStatus::Complete) => Pass::Done(ctx, Ok(())),
            Err(e) => Pass::Done(ctx, Err(e)),
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("id", &self.id)
            .field("current", &*self.current.lock())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
