//! Error types for the task subsystem.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Failed to start thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised synchronously by `TaskContext` calls.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

/// Ways a task can end other than completing normally.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task observed a cancellation request and unwound.
    #[error("Task was interrupted")]
    Interrupted,

    /// A newer submission replaced this one before its result was committed.
    #[error("Result of generation {generation} was superseded")]
    Superseded { generation: u64 },

    /// The manager shut down before or while the task ran.
    #[error("Task manager is shut down")]
    Shutdown,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Whether this error ends a task as cancelled rather than failed.
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::Superseded { .. } | Self::Shutdown
        )
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_classification() {
        assert!(TaskError::Interrupted.is_interruption());
        assert!(TaskError::Superseded { generation: 3 }.is_interruption());
        assert!(TaskError::Shutdown.is_interruption());
        assert!(!TaskError::Panicked("boom".into()).is_interruption());
        assert!(!TaskError::from(anyhow::anyhow!("disk full")).is_interruption());
    }

    #[test]
    fn other_is_transparent() {
        let err = TaskError::from(anyhow::anyhow!("connection refused"));
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn wraps_into_top_level() {
        let err: Error = ContextError::InvalidArgument {
            reason: "progress 2 is outside 0.0..=1.0".into(),
        }
        .into();
        assert!(matches!(err, Error::Context(_)));
        assert!(err.to_string().starts_with("Context error: Invalid argument"));
    }
}
