use kiln_core::{EnvironmentId, TaskError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error(
        "no suitable execution environment (local: {}, remote: [{}])",
        describe_local(.local),
        join(.remote)
    )]
    EnvironmentSelectionFailed {
        local: Option<Box<ClusterError>>,
        remote: Vec<ClusterError>,
    },

    #[error("environment {environment} is not suitable")]
    Unsuitable { environment: EnvironmentId },

    #[error("environment {environment} is not in the allowed set")]
    NotAllowed { environment: EnvironmentId },

    #[error("environment {environment} lost the race to start the task")]
    LostRace { environment: EnvironmentId },

    #[error("cluster task execution failed: [{}]", join(.causes))]
    ClusterTaskExecutionFailed {
        /// Set when the task had already started there.
        environment: Option<EnvironmentId>,
        causes: Vec<ClusterError>,
    },

    #[error("inner task could not be started in any environment: [{}]", join(.causes))]
    InnerTaskInitialization { causes: Vec<ClusterError> },

    #[error("mailbox of {environment} closed{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    MailboxClosed {
        environment: EnvironmentId,
        reason: Option<String>,
    },

    #[error("connection to {environment} broke: {reason}")]
    Disconnected {
        environment: EnvironmentId,
        reason: String,
    },

    #[error(transparent)]
    Task(#[from] TaskError),
}

fn describe_local(local: &Option<Box<ClusterError>>) -> String {
    local
        .as_ref()
        .map_or_else(|| "not evaluated".to_string(), |e| e.to_string())
}

fn join(causes: &[ClusterError]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClusterError {
    /// Flatten into the error type carried by inner task results.
    pub fn into_task_error(self, environment: EnvironmentId) -> TaskError {
        match self {
            Self::Task(e) => e,
            other => TaskError::Remote {
                environment: environment.to_string(),
                message: other.to_string(),
            },
        }
    }
}
