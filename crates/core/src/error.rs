use thiserror::Error;

/// Failure of a single task body, captured and routed through the normal
/// result channel instead of being raised on the executing thread.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task factory '{0}' did not produce a task")]
    NoTask(String),

    #[error("interrupted")]
    Interrupted,

    #[error("remote failure in environment {environment}: {message}")]
    Remote { environment: String, message: String },
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Build a failure from a panic payload caught with `catch_unwind`.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}
