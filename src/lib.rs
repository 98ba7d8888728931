//! Query Tasks: background task execution with query supersession.

pub mod config;
pub mod error;
pub mod query;
pub mod tasks;

pub use config::PoolConfig;
pub use error::{Error, Result, TaskError};
pub use query::{LatestResult, TaskQuery};
pub use tasks::{TaskContext, TaskManager, TaskState};
