//! Cluster invocation coordinator.
//!
//! A [`ClusterCoordinator`] owns the local execution site and one
//! [`Mailbox`] per connected cluster. Environment selection, single-task
//! dispatch and inner-task fan-out are all expressed as events posted to
//! those mailboxes; each cluster's [`TaskInvoker`] polls its mailbox on a
//! dedicated thread and resolves the events.

pub mod coordinator;
pub mod error;
pub mod event;
pub mod invoker;
pub mod mailbox;
pub mod parameters;
pub mod request;
pub mod results;
pub mod site;

pub use coordinator::ClusterCoordinator;
pub use error::ClusterError;
pub use event::{EventControl, InnerTaskExecutionEvent, InvocationEvent, TaskExecutionEvent};
pub use invoker::{ClusterTaskInvoker, TaskInvoker};
pub use mailbox::Mailbox;
pub use parameters::{DuplicationMode, InnerTaskParameters};
pub use request::selection::{SelectionEvent, SelectionFuture};
pub use request::task::TaskOutcome;
pub use results::InnerTaskResults;
pub use site::ExecutionSite;
