//! Task manager: runner pool, dispatch, and status relay.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::error::{Error, TaskError};
use crate::tasks::context::TaskContext;
use crate::tasks::events::{self, EventBus, ObserverId, Observers, TaskEvent};
use crate::tasks::runner::{Job, RunnerId, TaskRunner};
use crate::tasks::state::TaskSnapshot;
use crate::tasks::task::Task;

/// Counts describing the pool at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    /// Runner threads created so far.
    pub runners: usize,
    /// Runners waiting for work.
    pub idle: usize,
    /// Runners executing a task.
    pub busy: usize,
    /// Tasks waiting for a runner.
    pub queued: usize,
}

/// Owns the runner pool and dispatches submitted tasks to it.
///
/// Tasks go to an idle runner, to a newly spawned runner while the pool is
/// below `max_runners`, or otherwise wait in a FIFO queue until a runner is
/// released. Errors raised by tasks never surface here; they end up on the
/// task's `TaskContext`.
///
/// Dropping the manager shuts it down (see [`shutdown`](Self::shutdown)).
pub struct TaskManager {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// State reachable from runner threads.
pub(crate) struct Shared {
    config: PoolConfig,
    pool: Mutex<Pool>,
    bus: EventBus,
    observers: Arc<Observers>,
    next_generation: AtomicU64,
}

#[derive(Default)]
struct Pool {
    runners: Vec<RunnerSlot>,
    free: VecDeque<RunnerId>,
    pending: VecDeque<Job>,
    shutdown: bool,
}

struct RunnerSlot {
    runner: Arc<TaskRunner>,
    /// Dropped on shutdown so the thread exits.
    jobs: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Pool {
    fn can_grow(&self, max_runners: Option<usize>) -> bool {
        max_runners.is_none_or(|max| self.runners.len() < max)
    }

    /// Hand `job` to runner `id`, giving the job back if the runner is gone.
    fn dispatch(&mut self, id: RunnerId, job: Job) -> Result<(), Job> {
        let Some(jobs) = self.runners.get(id.index()).and_then(|slot| slot.jobs.as_ref()) else {
            return Err(job);
        };
        debug!(runner = %id, task_id = %job.context.id(), "Dispatching task");
        jobs.send(job).map_err(|e| e.0)
    }
}

impl TaskManager {
    /// Create a manager. Runner threads are started lazily on submission.
    pub fn new(config: PoolConfig) -> Result<Self, Error> {
        let (bus, rx) = EventBus::new(config.event_capacity);
        let observers = Arc::new(Observers::default());
        let dispatcher = events::spawn_dispatcher(
            format!("{}-events", config.thread_name),
            Arc::clone(&observers),
            rx,
        )?;

        info!(
            max_runners = ?config.max_runners,
            thread_name = %config.thread_name,
            "Task manager started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                pool: Mutex::new(Pool::default()),
                bus,
                observers,
                next_generation: AtomicU64::new(1),
            }),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Submit a task for background execution. Never blocks.
    pub fn submit(&self, task: impl Task) -> TaskContext {
        self.shared.submit(Box::new(task))
    }

    /// Call `observer` after every state change of every task.
    ///
    /// Callbacks run on the manager's event thread, one at a time; a slow
    /// observer delays later notifications but never a running task.
    pub fn register_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.shared.observers.register(Arc::new(observer))
    }

    /// Returns whether the observer was registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.unregister(id)
    }

    /// Receive task events on a broadcast channel. Slow receivers lag and
    /// lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.bus.subscribe()
    }

    pub fn summary(&self) -> PoolSummary {
        let pool = self.shared.pool.lock();
        PoolSummary {
            runners: pool.runners.len(),
            idle: pool.free.len(),
            busy: pool.runners.len() - pool.free.len(),
            queued: pool.pending.len(),
        }
    }

    /// Snapshots of the tasks currently bound to a runner.
    pub fn running(&self) -> Vec<TaskSnapshot> {
        let runners: Vec<Arc<TaskRunner>> = self
            .shared
            .pool
            .lock()
            .runners
            .iter()
            .map(|slot| Arc::clone(&slot.runner))
            .collect();

        runners
            .iter()
            .filter_map(|runner| runner.current_context())
            .map(|ctx| ctx.snapshot())
            .collect()
    }

    /// Stop accepting work and wind the pool down.
    ///
    /// Queued tasks finish as cancelled, running tasks are asked to cancel,
    /// and the call waits for runner threads to exit, which includes waiting
    /// for tasks that ignore cancellation. Tasks submitted afterwards finish
    /// immediately as cancelled with `TaskError::Shutdown`. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.shutdown() {
            return;
        }

        self.shared.bus.stop();
        if let Some(handle) = self.dispatcher.lock().take() {
            join_unless_current(handle);
        }
        info!("Task manager shut down");
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn submit(self: &Arc<Self>, task: Box<dyn Task>) -> TaskContext {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let ctx = TaskContext::new(generation, task.description(), self.bus.clone());
        let job = Job {
            task,
            context: ctx.clone(),
        };

        debug!(
            task_id = %ctx.id(),
            generation,
            task = %ctx.description(),
            "Task submitted"
        );

        let mut pool = self.pool.lock();
        if pool.shutdown {
            drop(pool);
            ctx.interrupted(TaskError::Shutdown);
            return ctx;
        }

        if let Some(id) = pool.free.pop_front() {
            if let Err(job) = pool.dispatch(id, job) {
                pool.pending.push_back(job);
            }
            return ctx;
        }

        if pool.can_grow(self.config.max_runners) {
            match self.spawn_runner(&mut pool) {
                Ok(id) => {
                    if let Err(job) = pool.dispatch(id, job) {
                        pool.pending.push_back(job);
                    }
                }
                Err(e) if pool.runners.is_empty() => {
                    drop(pool);
                    error!(error = %e, "Failed to start runner thread; no runners available");
                    ctx.failed(TaskError::Other(anyhow::anyhow!(
                        "failed to start runner thread: {e}"
                    )));
                }
                Err(e) => {
                    error!(error = %e, "Failed to start runner thread; queueing task");
                    pool.pending.push_back(job);
                }
            }
            return ctx;
        }

        debug!(task_id = %ctx.id(), queued = pool.pending.len() + 1, "Pool at capacity; task queued");
        pool.pending.push_back(job);
        ctx
    }

    fn spawn_runner(self: &Arc<Self>, pool: &mut Pool) -> std::io::Result<RunnerId> {
        let id = RunnerId::new(pool.runners.len());
        let (runner, jobs, thread) = TaskRunner::spawn(
            id,
            format!("{}-{}", self.config.thread_name, id.index()),
            Arc::clone(self),
        )?;
        pool.runners.push(RunnerSlot {
            runner,
            jobs: Some(jobs),
            thread: Some(thread),
        });
        debug!(runner = %id, total = pool.runners.len(), "Runner spawned");
        Ok(id)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.pool.lock().shutdown
    }

    /// Called by a runner after each pass. `requeue` carries a task that asked
    /// for another pass; it goes to the back of the queue.
    pub(crate) fn release(&self, id: RunnerId, requeue: Option<Job>) {
        let mut pool = self.pool.lock();

        if pool.shutdown {
            pool.free.push_back(id);
            drop(pool);
            if let Some(job) = requeue {
                job.context.interrupted(TaskError::Shutdown);
            }
            return;
        }

        if let Some(job) = requeue {
            pool.pending.push_back(job);
        }

        while let Some(job) = pool.pending.pop_front() {
            match pool.dispatch(id, job) {
                Ok(()) => return,
                Err(job) => {
                    // Runner is gone; keep the job for the next release
                    pool.pending.push_front(job);
                    return;
                }
            }
        }

        debug!(runner = %id, "Runner idle");
        pool.free.push_back(id);
    }

    /// Returns false if already shut down.
    fn shutdown(&self) -> bool {
        let (pending, runners, threads) = {
            let mut pool = self.pool.lock();
            if pool.shutdown {
                return false;
            }
            pool.shutdown = true;

            let pending: Vec<Job> = pool.pending.drain(..).collect();
            let mut runners = Vec::with_capacity(pool.runners.len());
            let mut threads = Vec::with_capacity(pool.runners.len());
            for slot in pool.runners.iter_mut() {
                slot.jobs = None;
                runners.push(Arc::clone(&slot.runner));
                if let Some(thread) = slot.thread.take() {
                    threads.push(thread);
                }
            }
            (pending, runners, threads)
        };

        info!(
            queued = pending.len(),
            runners = runners.len(),
            "Shutting down task manager"
        );

        for job in pending {
            job.context.interrupted(TaskError::Shutdown);
        }
        for runner in &runners {
            if let Some(ctx) = runner.current_context() {
                ctx.cancel();
            }
        }
        for thread in threads {
            join_unless_current(thread);
        }
        true
    }
}

/// Join `handle`, unless it is the calling thread (a task or observer that
/// held the last reference to the manager).
fn join_unless_current(handle: JoinHandle<()>) {
    if handle.thread().id() == std::thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        error!("Task thread panicked during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tasks::state::TaskState;
    use crate::tasks::task::TaskStatus;

    const WAIT: Duration = Duration::from_secs(10);

    fn manager(max_runners: Option<usize>) -> TaskManager {
        let config = PoolConfig {
            thread_name: "test-runner".to_string(),
            max_runners,
            ..PoolConfig::default()
        };
        TaskManager::new(config).unwrap()
    }

    #[test]
    fn runs_a_task_to_completion() {
        let manager = manager(None);
        let ctx = manager.submit(|_ctx: &TaskContext| Ok(TaskStatus::Complete));

        assert!(ctx.wait_timeout(WAIT));
        assert_eq!(ctx.state(), TaskState::Completed);
        assert_eq!(ctx.generation(), 1);
    }

    #[test]
    fn runner_threads_take_the_configured_name() {
        let manager = manager(None);
        let (name_tx, name_rx) = std::sync::mpsc::channel();
        let ctx = manager.submit(move |_ctx: &TaskContext| {
            let _ = name_tx.send(std::thread::current().name().map(str::to_string));
            Ok(TaskStatus::Complete)
        });

        assert!(ctx.wait_timeout(WAIT));
        let expected = format!("{}-0", manager.config().thread_name);
        assert_eq!(name_rx.recv_timeout(WAIT).unwrap(), Some(expected));
    }

    #[test]
    fn unbounded_sleep_ends_cancelled() {
        let manager = manager(None);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let ctx = manager.submit(move |ctx: &TaskContext| {
            let _ = started_tx.send(());
            ctx.sleep(Duration::MAX)?;
            Ok(TaskStatus::Complete)
        });

        started_rx.recv_timeout(WAIT).unwrap();
        assert!(ctx.cancel());
        assert!(ctx.wait_timeout(WAIT));
        assert_eq!(ctx.state(), TaskState::Cancelled);
        assert!(matches!(
            ctx.finished_error().as_deref(),
            Some(TaskError::Interrupted)
        ));
    }

    #[test]
    fn generations_increase_per_submission() {
        let manager = manager(None);
        let a = manager.submit(|_ctx: &TaskContext| Ok(TaskStatus::Complete));
        let b = manager.submit(|_ctx: &TaskContext| Ok(TaskStatus::Complete));
        assert!(b.generation() > a.generation());
    }

    #[test]
    fn reuses_idle_runner() {
        let manager = manager(None);
        for _ in 0..5 {
            let ctx = manager.submit(|_ctx: &TaskContext| Ok(TaskStatus::Complete));
            assert!(ctx.wait_timeout(WAIT));
        }
        let summary = manager.summary();
        assert_eq!(summary.runners, 1);
        assert_eq!(summary.idle, 1);
        assert_eq!(summary.queued, 0);
    }

    #[test]
    fn grows_while_runners_are_busy() {
        let manager = manager(Some(3));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        let contexts: Vec<_> = (0..3)
            .map(|_| {
                let rx = Arc::clone(&release_rx);
                manager.submit(move |_ctx: &TaskContext| {
                    let _ = rx.lock().unwrap().recv_timeout(WAIT);
                    Ok(TaskStatus::Complete)
                })
            })
            .collect();

        let summary = manager.summary();
        assert_eq!(summary.runners, 3);
        assert_eq!(summary.queued, 0);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        for ctx in &contexts {
            assert!(ctx.wait_timeout(WAIT));
        }
    }

    #[test]
    fn continue_runs_another_pass() {
        let manager = manager(Some(1));
        let mut passes = 0;
        let ctx = manager.submit(move |ctx: &TaskContext| {
            passes += 1;
            ctx.set_progress(passes as f64 / 3.0).unwrap();
            if passes < 3 {
                Ok(TaskStatus::Continue)
            } else {
                Ok(TaskStatus::Complete)
            }
        });

        assert!(ctx.wait_timeout(WAIT));
        assert_eq!(ctx.state(), TaskState::Completed);
        assert_eq!(ctx.progress(), 1.0);
    }

    #[test]
    fn cancelled_continue_task_stops() {
        let manager = manager(Some(1));
        let ctx = manager.submit(|ctx: &TaskContext| {
            ctx.sleep(Duration::from_millis(5))?;
            Ok(TaskStatus::Continue)
        });

        std::thread::sleep(Duration::from_millis(30));
        assert!(ctx.cancel());
        assert!(ctx.wait_timeout(WAIT));
        assert_eq!(ctx.state(), TaskState::Cancelled);
        assert_eq!(ctx.action_caption(), "Cancelled");
    }

    #[test]
    fn panicking_task_fails_and_runner_survives() {
        let manager = manager(Some(1));
        let ctx = manager.submit(|_ctx: &TaskContext| -> Result<TaskStatus, TaskError> {
            panic!("index out of bounds");
        });
        assert!(ctx.wait_timeout(WAIT));
        assert_eq!(ctx.state(), TaskState::Failed);
        assert!(matches!(
            ctx.finished_error().as_deref(),
            Some(TaskError::Panicked(msg)) if msg == "index out of bounds"
        ));

        let next = manager.submit(|_ctx: &TaskContext| Ok(TaskStatus::Complete));
        assert!(next.wait_timeout(WAIT));
        assert_eq!(next.state(), TaskState::Completed);
        assert_eq!(manager.summary().runners, 1);
    }

    #[test]
    fn running_lists_bound_tasks() {
        let manager = manager(None);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let ctx = manager.submit(move |ctx: &TaskContext| {
            let _ = started_tx.send(());
            ctx.sleep(WAIT)?;
            Ok(TaskStatus::Complete)
        });

        started_rx.recv_timeout(WAIT).unwrap();
        let running = manager.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, ctx.id());
        assert_eq!(running[0].state, TaskState::Running);

        ctx.cancel();
        assert!(ctx.wait_timeout(WAIT));
    }

    #[test]
    fn shutdown_cancels_queued_and_running() {
        let manager = manager(Some(1));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let running = manager.submit(move |ctx: &TaskContext| {
            let _ = started_tx.send(());
            ctx.sleep(WAIT)?;
            Ok(TaskStatus::Complete)
        });
        started_rx.recv_timeout(WAIT).unwrap();
        let queued = manager.submit(|_ctx: &TaskContext| Ok(TaskStatus::Complete));

        manager.shutdown();

        assert!(running.is_finished());
        assert_eq!(running.state(), TaskState::Cancelled);
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert!(matches!(
            queued.finished_error().as_deref(),
            Some(TaskError::Shutdown)
        ));

        let late = manager.submit(|_ctx: &TaskContext| Ok(TaskStatus::Complete));
        assert!(late.is_finished());
        assert!(matches!(late.finished_error().as_deref(), Some(TaskError::Shutdown)));

        manager.shutdown();
    }

    #[test]
    fn job_reaching_a_runner_after_shutdown_does_not_run() {
        let manager = manager(None);
        manager.shutdown();

        // A job still buffered in a runner channel when shutdown starts.
        let ctx = TaskContext::new(99, "late job".to_string(), manager.shared.bus.clone());
        let job = Job {
            task: Box::new(|_ctx: &TaskContext| -> Result<TaskStatus, TaskError> {
                panic!("job ran after shutdown")
            }),
            context: ctx.clone(),
        };
        let (_runner, jobs, thread) = TaskRunner::spawn(
            RunnerId::new(7),
            "late-runner".to_string(),
            Arc::clone(&manager.shared),
        )
        .unwrap();
        assert!(jobs.send(job).is_ok());
        drop(jobs);
        thread.join().unwrap();

        assert_eq!(ctx.state(), TaskState::Cancelled);
        assert!(matches!(
            ctx.finished_error().as_deref(),
            Some(TaskError::Shutdown)
        ));
    }
}
