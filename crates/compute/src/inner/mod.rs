//! Inner task duplication engine.
//!
//! An inner task is run as one or more concurrent invocations inside a single
//! execution environment. [`InnerTaskManager::invoke_inner_task`] returns an
//! [`InnerTaskHandle`] through which results are collected while a driver
//! thread keeps duplicating the task as long as its predicate, the available
//! computation tokens and the environment ceiling allow.

mod counter;
mod execution;
mod handle;
mod manager;
mod pool;

#[cfg(test)]
mod tests;

pub use counter::{InvocationCounter, InvocationCounts};
pub use execution::run_task;
pub use handle::{InnerTaskHandle, InnerTaskListener, InnerTaskResult, NoopListener};
pub use manager::{InnerTaskManager, InnerTaskRequest};
