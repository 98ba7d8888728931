//! Query supersession: a value that always reflects the latest query.
//!
//! `TaskQuery` runs each query as a background task. Setting a new query
//! cancels the one in flight, and a query may only publish its result while
//! its generation is still the active one. The generation check and the write
//! happen under one lock, so a superseded query can never commit, even if it
//! finished computing before it was cancelled.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::TaskError;
use crate::tasks::{Task, TaskContext, TaskManager, TaskStatus};

/// Sink holding the result of the most recent query.
pub struct LatestResult<T> {
    state: Mutex<SlotState<T>>,
}

struct SlotState<T> {
    /// Generation allowed to commit; `None` while nothing is current.
    active: Option<u64>,
    current: Option<TaskContext>,
    value: Option<Arc<T>>,
    committed_generation: Option<u64>,
}

impl<T> Default for LatestResult<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                active: None,
                current: None,
                value: None,
                committed_generation: None,
            }),
        }
    }
}

impl<T> LatestResult<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` if `ctx` is still the current query.
    ///
    /// Fails with `TaskError::Superseded` when a newer query replaced `ctx`
    /// or `ctx` was cancelled; the value is dropped.
    pub fn commit(&self, ctx: &TaskContext, value: T) -> Result<(), TaskError> {
        let mut state = self.state.lock();
        if state.active != Some(ctx.generation()) || ctx.is_cancel_requested() {
            debug!(
                task_id = %ctx.id(),
                generation = ctx.generation(),
                active = ?state.active,
                "Discarding superseded result"
            );
            return Err(TaskError::Superseded {
                generation: ctx.generation(),
            });
        }
        state.value = Some(Arc::new(value));
        state.committed_generation = Some(ctx.generation());
        Ok(())
    }

    /// Latest committed value.
    pub fn get(&self) -> Option<Arc<T>> {
        self.state.lock().value.clone()
    }

    /// Generation of the query that produced [`get`](Self::get).
    pub fn committed_generation(&self) -> Option<u64> {
        self.state.lock().committed_generation
    }

    /// Generation currently allowed to commit.
    pub fn active_generation(&self) -> Option<u64> {
        self.state.lock().active
    }
}

/// Runs queries on a `TaskManager`, keeping only the newest one current.
pub struct TaskQuery<T> {
    manager: Arc<TaskManager>,
    results: Arc<LatestResult<T>>,
}

impl<T> TaskQuery<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self {
            manager,
            results: Arc::new(LatestResult::new()),
        }
    }

    /// Replace the current query.
    ///
    /// The previous query is cancelled and can no longer commit. The new
    /// query runs in the background; its result becomes visible through
    /// [`get`](Self::get) once it finishes, unless it is superseded first.
    pub fn set_query<Q>(&self, description: impl Into<String>, query: Q) -> TaskContext
    where
        Q: FnOnce(&TaskContext) -> Result<T, TaskError> + Send + 'static,
    {
        let task = QueryTask {
            description: description.into(),
            query: Some(query),
            results: Arc::clone(&self.results),
        };

        // Held across cancel + submit so the new query cannot try to commit
        // before its generation is active.
        let mut state = self.results.state.lock();
        state.active = None;
        if let Some(previous) = state.current.take() {
            previous.cancel();
        }

        let ctx = self.manager.submit(task);
        state.active = Some(ctx.generation());
        state.current = Some(ctx.clone());
        ctx
    }

    /// Cancel the current query without replacing it. Returns whether a
    /// cancellation was requested.
    pub fn cancel(&self) -> bool {
        let mut state = self.results.state.lock();
        state.active = None;
        state.current.take().is_some_and(|ctx| ctx.cancel())
    }

    /// Context of the current query, if any.
    pub fn current(&self) -> Option<TaskContext> {
        self.results.state.lock().current.clone()
    }

    /// Latest committed result.
    pub fn get(&self) -> Option<Arc<T>> {
        self.results.get()
    }

    pub fn results(&self) -> &Arc<LatestResult<T>> {
        &self.results
    }
}

/// One query run as a task.
struct QueryTask<T, Q> {
    description: String,
    query: Option<Q>,
    results: Arc<LatestResult<T>>,
}

impl<T, Q> Task for QueryTask<T, Q>
where
    T: Send + Sync + 'static,
    Q: FnOnce(&TaskContext) -> Result<T, TaskError> + Send + 'static,
{
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskStatus, TaskError> {
        let Some(query) = self.query.take() else {
            return Ok(TaskStatus::Complete);
        };

        ctx.set_busy_with_caption(true, "Running query");
        let value = query(ctx)?;
        self.results.commit(ctx, value)?;
        ctx.set_busy(false);
        Ok(TaskStatus::Complete)
    }

    fn description(&self) -> String {
        format!("Running query: {}", self.description)
    }
}
