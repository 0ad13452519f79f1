//! Units of work posted to a cluster mailbox.
//!
//! Every event resolves exactly once (success, failure, unsuitable or
//! dismissed) and `is_active` only ever goes from true to false. Events of
//! the task kinds are generic over the task's result type internally and are
//! handed to invokers behind object-safe traits.

use std::sync::Arc;

use crate::error::ClusterError;
use crate::request::selection::SelectionEvent;
use crate::site::ExecutionSite;

/// Resolution hooks shared by every event kind.
pub trait EventControl: Send + Sync {
    /// Worth delivering to the invoker.
    fn is_active(&self) -> bool;

    /// Nothing further can happen to this event; the mailbox may forget it.
    fn is_finished(&self) -> bool;

    /// Terminal failure, e.g. the mailbox closed.
    fn fail(&self, cause: ClusterError);

    /// Resolve without a response because the event went inactive while queued.
    fn dismiss(&self);
}

/// Single-task dispatch as seen by a cluster.
pub trait TaskExecutionEvent: EventControl {
    fn task_name(&self) -> &str;

    /// Claim the task for this environment. Exactly one candidate succeeds;
    /// the others are failed with [`ClusterError::LostRace`].
    fn start_execution(&self) -> Result<(), ClusterError>;

    /// Run a task that this event already started and report the outcome.
    fn run_started(&self, site: &ExecutionSite);

    /// Check suitability, start, run and report.
    fn execute(&self, site: &ExecutionSite);
}

/// Inner-task dispatch as seen by a cluster.
pub trait InnerTaskExecutionEvent: EventControl {
    fn task_name(&self) -> &str;

    /// Start a contributing engine in `site`. Returns once it was started.
    fn execute(&self, site: &ExecutionSite);
}

#[derive(Clone)]
pub enum InvocationEvent {
    SelectEnvironment(Arc<SelectionEvent>),
    ExecuteTask(Arc<dyn TaskExecutionEvent>),
    ExecuteInnerTask(Arc<dyn InnerTaskExecutionEvent>),
}

impl InvocationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SelectEnvironment(_) => "select-environment",
            Self::ExecuteTask(_) => "execute-task",
            Self::ExecuteInnerTask(_) => "execute-inner-task",
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Self::SelectEnvironment(e) => e.is_active(),
            Self::ExecuteTask(e) => e.is_active(),
            Self::ExecuteInnerTask(e) => e.is_active(),
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            Self::SelectEnvironment(e) => e.is_finished(),
            Self::ExecuteTask(e) => e.is_finished(),
            Self::ExecuteInnerTask(e) => e.is_finished(),
        }
    }

    pub fn fail(&self, cause: ClusterError) {
        match self {
            Self::SelectEnvironment(e) => e.fail(cause),
            Self::ExecuteTask(e) => e.fail(cause),
            Self::ExecuteInnerTask(e) => e.fail(cause),
        }
    }

    pub fn dismiss(&self) {
        match self {
            Self::SelectEnvironment(e) => e.dismiss(),
            Self::ExecuteTask(e) => e.dismiss(),
            Self::ExecuteInnerTask(e) => e.dismiss(),
        }
    }
}

impl std::fmt::Debug for InvocationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationEvent")
            .field("kind", &self.kind())
            .field("active", &self.is_active())
            .finish()
    }
}
