//! Remote side of a cluster connection.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kiln_compute::TokenAllocator;
use kiln_core::sync::OnceLatch;
use kiln_core::{EnvironmentId, ExecutionConfig, ExecutionEnvironment};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::event::{InnerTaskExecutionEvent, InvocationEvent, TaskExecutionEvent};
use crate::mailbox::Mailbox;
use crate::site::ExecutionSite;

/// How often a polling loop checks its link while the mailbox is idle.
const HEARTBEAT: Duration = Duration::from_millis(25);

/// Serves one cluster mailbox until it closes. An `Err` return means the
/// link broke; the mailbox is then closed with that cause.
pub trait TaskInvoker: Send + Sync {
    fn run(&self, mailbox: &Mailbox) -> Result<(), ClusterError>;
}

/// In-process stand-in for a remote worker environment: its own properties,
/// token pool and inner task engine.
pub struct ClusterTaskInvoker {
    site: Arc<ExecutionSite>,
    disconnected: OnceLatch<String>,
}

impl ClusterTaskInvoker {
    pub fn new(environment: ExecutionEnvironment, config: &ExecutionConfig) -> Self {
        Self::with_allocator(environment, Arc::new(TokenAllocator::from_config(config)))
    }

    pub fn with_allocator(environment: ExecutionEnvironment, allocator: Arc<TokenAllocator>) -> Self {
        Self {
            site: Arc::new(ExecutionSite::new(environment, allocator)),
            disconnected: OnceLatch::new(),
        }
    }

    pub fn environment_id(&self) -> EnvironmentId {
        self.site.environment_id()
    }

    pub fn site(&self) -> &Arc<ExecutionSite> {
        &self.site
    }

    /// Simulate a broken link: the polling loop returns an error at its next
    /// heartbeat without waiting for running work.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.disconnected.set(reason.into());
    }

    fn dispatch(&self, event: InvocationEvent) -> Option<JoinHandle<()>> {
        let site = Arc::clone(&self.site);
        let kind = event.kind();
        let spawned = thread::Builder::new()
            .name(format!("cluster-worker-{}", site.environment_id().short()))
            .spawn({
                let event = event.clone();
                move || match event {
                    InvocationEvent::SelectEnvironment(e) => e.evaluate(site.environment()),
                    InvocationEvent::ExecuteTask(e) => e.execute(&site),
                    InvocationEvent::ExecuteInnerTask(e) => e.execute(&site),
                }
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(kind, error = %e, "failed to start cluster worker");
                event.fail(ClusterError::Task(kiln_core::TaskError::failed(format!(
                    "failed to start cluster worker: {e}"
                ))));
                None
            }
        }
    }
}

impl TaskInvoker for ClusterTaskInvoker {
    fn run(&self, mailbox: &Mailbox) -> Result<(), ClusterError> {
        let environment = self.site.environment_id();
        info!(environment = %environment, "Cluster invoker serving mailbox");
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        loop {
            if let Some(reason) = self.disconnected.get() {
                warn!(
                    environment = %environment,
                    abandoned_workers = workers.iter().filter(|w| !w.is_finished()).count(),
                    "Cluster link broke: {reason}"
                );
                return Err(ClusterError::Disconnected {
                    environment,
                    reason,
                });
            }
            let Some(batch) = mailbox.poll_timeout(HEARTBEAT) else {
                break;
            };
            workers.retain(|w| !w.is_finished());
            for event in batch {
                debug!(environment = %environment, kind = event.kind(), "handling event");
                workers.extend(self.dispatch(event));
            }
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!(environment = %environment, "cluster worker panicked");
            }
        }
        self.site.close();
        info!(environment = %environment, "Cluster invoker stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ClusterTaskInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTaskInvoker")
            .field("environment", &self.site.environment_id())
            .field("disconnected", &self.disconnected.is_set())
            .finish()
    }
}
