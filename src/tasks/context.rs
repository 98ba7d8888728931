//! Per-submission status and control object.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ContextError, TaskError};
use crate::tasks::events::{EventBus, TaskEvent, TaskEventKind};
use crate::tasks::runner::RunnerId;
use crate::tasks::state::{TaskSnapshot, TaskState};

/// Status/control handle for one submitted task.
///
/// The task reports progress through it; the consumer reads it and may call
/// [`cancel`](Self::cancel). Cloning is cheap and every clone refers to the
/// same context. All methods are safe to call from any thread: mutations are
/// serialized by a per-context lock and each one notifies the manager's
/// observers while the lock is held, so notifications of one context are
/// delivered in call order.
///
/// Once the context is finished it is frozen; further mutations are ignored.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    generation: u64,
    description: String,
    /// Mirror of the cancel request for lock-free checkpoints.
    cancel_requested: AtomicBool,
    state: Mutex<ContextState>,
    /// Woken on cancellation and on finish.
    signal: Condvar,
    bus: EventBus,
}

struct ContextState {
    state: TaskState,
    busy: bool,
    progress: f64,
    cancellable: bool,
    action_caption: String,
    finished_error: Option<Arc<TaskError>>,
    runner: Option<RunnerId>,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

fn validate_progress(progress: f64) -> Result<(), ContextError> {
    if (0.0..=1.0).contains(&progress) {
        Ok(())
    } else {
        Err(ContextError::InvalidArgument {
            reason: format!("progress must be between 0.0 and 1.0, got {progress}"),
        })
    }
}

impl TaskContext {
    pub(crate) fn new(generation: u64, description: String, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                generation,
                description,
                cancel_requested: AtomicBool::new(false),
                state: Mutex::new(ContextState {
                    state: TaskState::Queued,
                    busy: false,
                    progress: 0.0,
                    cancellable: true,
                    action_caption: String::new(),
                    finished_error: None,
                    runner: None,
                    submitted_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                }),
                signal: Condvar::new(),
                bus,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(description: &str, bus: EventBus) -> Self {
        Self::new(0, description.to_string(), bus)
    }

    // ── Task-facing reporting ───────────────────────────────────────────

    /// Set progress to a value in `0.0..=1.0` and clear the busy flag.
    pub fn set_progress(&self, progress: f64) -> Result<(), ContextError> {
        self.apply_progress(progress, None)
    }

    /// Set progress and the action caption in one notification.
    pub fn set_progress_with_caption(
        &self,
        progress: f64,
        caption: impl Into<String>,
    ) -> Result<(), ContextError> {
        self.apply_progress(progress, Some(caption.into()))
    }

    fn apply_progress(&self, progress: f64, caption: Option<String>) -> Result<(), ContextError> {
        validate_progress(progress)?;
        self.update(TaskEventKind::Progress, |s| {
            s.progress = progress;
            s.busy = false;
            if let Some(caption) = caption {
                s.action_caption = caption;
            }
        });
        Ok(())
    }

    /// Signal work with no predictable completion point.
    pub fn set_busy(&self, busy: bool) {
        self.update(TaskEventKind::Busy, |s| s.busy = busy);
    }

    pub fn set_busy_with_caption(&self, busy: bool, caption: impl Into<String>) {
        let caption = caption.into();
        self.update(TaskEventKind::Busy, |s| {
            s.busy = busy;
            s.action_caption = caption;
        });
    }

    /// Enable or disable [`cancel`](Self::cancel). Only the task itself should call this.
    pub fn set_cancellable(&self, cancellable: bool) {
        self.update(TaskEventKind::Cancellable, |s| s.cancellable = cancellable);
    }

    /// Describe the current step, e.g. "Wrote 256 of 2028 bytes".
    pub fn set_action_caption(&self, caption: impl Into<String>) {
        let caption = caption.into();
        self.update(TaskEventKind::Caption, |s| s.action_caption = caption);
    }

    /// Return `Err(TaskError::Interrupted)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancel_requested() {
            Err(TaskError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Wait for `duration`, returning early with `Interrupted` if the
    /// context is cancelled in the meantime.
    /// A duration too large to represent as a deadline waits until cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        let deadline = Instant::now().checked_add(duration);
        let mut state = self.inner.state.lock();
        while !self.is_cancel_requested() {
            match deadline {
                Some(deadline) => {
                    if self.inner.signal.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.signal.wait(&mut state),
            }
        }
        drop(state);
        self.checkpoint()
    }

    // ── Consumer-facing control ─────────────────────────────────────────

    /// Request cancellation of the task.
    ///
    /// Does nothing if the task is not cancellable, already finished, or
    /// already asked to cancel. Never blocks on the task; the task stops at
    /// its next checkpoint, or never if it does not check. Returns whether
    /// this call made the request.
    pub fn cancel(&self) -> bool {
        let state = self.inner.state.lock();
        if state.state.is_terminal()
            || !state.cancellable
            || self.inner.cancel_requested.load(Ordering::Acquire)
        {
            return false;
        }
        self.inner.cancel_requested.store(true, Ordering::Release);
        self.inner.signal.notify_all();
        let runner = state.runner;
        drop(state);

        info!(
            task_id = %self.inner.id,
            generation = self.inner.generation,
            runner = ?runner,
            "Cancellation requested"
        );
        true
    }

    /// Block until the task has finished.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.state.is_terminal() {
            self.inner.signal.wait(&mut state);
        }
    }

    /// Block until the task has finished or `timeout` elapses. Returns whether it finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut state = self.inner.state.lock();
        while !state.state.is_terminal() {
            if self.inner.signal.wait_until(&mut state, deadline).timed_out() {
                return state.state.is_terminal();
            }
        }
        true
    }

    // ── Read accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Submission epoch; a larger generation was submitted later.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.lock().state
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().busy
    }

    pub fn progress(&self) -> f64 {
        self.inner.state.lock().progress
    }

    pub fn action_caption(&self) -> String {
        self.inner.state.lock().action_caption.clone()
    }

    /// Whether the task completed, was cancelled, or failed.
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().state.is_terminal()
    }

    /// The error the task was cancelled or failed with.
    pub fn finished_error(&self) -> Option<Arc<TaskError>> {
        self.inner.state.lock().finished_error.clone()
    }

    pub fn is_cancellable(&self) -> bool {
        self.inner.state.lock().cancellable
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Runner currently executing the task, if any.
    pub fn runner(&self) -> Option<RunnerId> {
        self.inner.state.lock().runner
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.inner.state.lock();
        self.snapshot_locked(&state)
    }

    // ── Runner-side transitions ─────────────────────────────────────────

    /// Bind to `runner` and mark running. Returns false if the context can no
    /// longer start (it already finished).
    pub(crate) fn start(&self, runner: RunnerId) -> bool {
        let mut state = self.inner.state.lock();
        if !state.state.can_transition_to(TaskState::Running) {
            return false;
        }
        state.state = TaskState::Running;
        state.runner = Some(runner);
        state.started_at.get_or_insert_with(Utc::now);
        self.emit_locked(TaskEventKind::Started, &state);
        true
    }

    /// Unbind from the runner and go back to waiting for another pass.
    pub(crate) fn requeue(&self) {
        let mut state = self.inner.state.lock();
        if !state.state.can_transition_to(TaskState::Queued) {
            return;
        }
        state.state = TaskState::Queued;
        state.runner = None;
        self.emit_locked(TaskEventKind::Requeued, &state);
    }

    pub(crate) fn complete(&self) -> bool {
        self.finish(TaskState::Completed, None)
    }

    pub(crate) fn interrupted(&self, err: TaskError) -> bool {
        self.finish(TaskState::Cancelled, Some(err))
    }

    pub(crate) fn failed(&self, err: TaskError) -> bool {
        self.finish(TaskState::Failed, Some(err))
    }

    fn finish(&self, outcome: TaskState, error: Option<TaskError>) -> bool {
        let mut state = self.inner.state.lock();
        if !state.state.can_transition_to(outcome) {
            warn!(
                task_id = %self.inner.id,
                state = %state.state,
                target = %outcome,
                "Ignoring terminal transition"
            );
            return false;
        }

        if outcome == TaskState::Completed {
            state.progress = 1.0;
        }
        state.state = outcome;
        state.busy = false;
        state.cancellable = false;
        state.action_caption = outcome.terminal_caption().unwrap_or_default().to_string();
        state.finished_error = error.map(Arc::new);
        state.runner = None;
        state.finished_at = Some(Utc::now());

        match (&state.finished_error, outcome) {
            (Some(err), TaskState::Failed) => warn!(
                task_id = %self.inner.id,
                task = %self.inner.description,
                error = %err,
                "Task failed"
            ),
            (Some(err), _) => info!(
                task_id = %self.inner.id,
                task = %self.inner.description,
                reason = %err,
                "Task cancelled"
            ),
            (None, _) => debug!(
                task_id = %self.inner.id,
                task = %self.inner.description,
                "Task complete"
            ),
        }

        self.emit_locked(TaskEventKind::Finished, &state);
        self.inner.signal.notify_all();
        true
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn update(&self, kind: TaskEventKind, f: impl FnOnce(&mut ContextState)) {
        let mut state = self.inner.state.lock();
        if state.state.is_terminal() {
            debug!(task_id = %self.inner.id, kind = ?kind, "Ignoring update to finished task");
            return;
        }
        f(&mut *state);
        self.emit_locked(kind, &state);
    }

    fn emit_locked(&self, kind: TaskEventKind, state: &ContextState) {
        self.inner.bus.emit(TaskEvent {
            kind,
            context: self.clone(),
            snapshot: self.snapshot_locked(state),
        });
    }

    fn snapshot_locked(&self, state: &ContextState) -> TaskSnapshot {
        TaskSnapshot {
            id: self.inner.id,
            generation: self.inner.generation,
            description: self.inner.description.clone(),
            state: state.state,
            busy: state.busy,
            progress: state.progress,
            cancellable: state.cancellable,
            action_caption: state.action_caption.clone(),
            finished: state.state.is_terminal(),
            error: state.finished_error.as_ref().map(|e| e.to_string()),
            runner: state.runner,
            submitted_at: state.submitted_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.inner.id)
            .field("generation", &self.inner.generation)
            .field("description", &self.inner.description)
            .finish_non_exhaustive()
    }
}
