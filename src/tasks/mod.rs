//! Background task execution on a pool of runner threads.
//!
//! Core components:
//! - `task`: the `Task` trait and pass status (`Complete` / `Continue`)
//! - `state`: task lifecycle (Queued → Running → Completed/Cancelled/Failed)
//! - `context`: `TaskContext`, per-submission status and cancellation
//! - `events`: status-change events, observers and the dispatcher thread
//! - `runner`: `TaskRunner`, one worker thread executing one task at a time
//! - `manager`: `TaskManager`, pool ownership, dispatch and queueing

pub mod context;
pub mod events;
pub mod manager;
pub mod runner;
pub mod state;
pub mod task;

pub use context::TaskContext;
pub use events::{Observer, ObserverId, TaskEvent, TaskEventKind};
pub use manager::{PoolSummary, TaskManager};
pub use runner::{RunnerId, TaskRunner};
pub use state::{TaskSnapshot, TaskState};
pub use task::{FnTask, Task, TaskStatus};
