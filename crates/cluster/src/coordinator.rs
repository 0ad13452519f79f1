//! Placement of tasks on the local environment and connected clusters.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use kiln_compute::{run_task, AllocatorKey, TokenAllocator};
use kiln_core::sync::lock;
use kiln_core::{
    Capability, EnvironmentId, ExecutionConfig, ExecutionEnvironment, SelectionResult,
    TaskContext, TaskError, TaskFactory,
};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::event::InvocationEvent;
use crate::invoker::TaskInvoker;
use crate::mailbox::Mailbox;
use crate::parameters::InnerTaskParameters;
use crate::request::inner::{InnerRequest, InnerTaskEvent};
use crate::request::selection::{SelectionEvent, SelectionFuture, SelectionRequest};
use crate::request::task::{RaceEnd, TaskEvent, TaskOutcome, TaskRequest};
use crate::results::{InnerTaskResults, ResultsShared};
use crate::site::ExecutionSite;

struct Connection {
    mailbox: Arc<Mailbox>,
    thread: Option<JoinHandle<()>>,
}

pub struct ClusterCoordinator {
    local: Arc<ExecutionSite>,
    connections: Mutex<Vec<Connection>>,
    closed: AtomicBool,
}

impl ClusterCoordinator {
    /// Coordinator whose local token pool is sized from `config`.
    pub fn new(local: ExecutionEnvironment, config: &ExecutionConfig) -> Self {
        Self::with_allocator(local, Arc::new(TokenAllocator::from_config(config)))
    }

    /// Coordinator sharing an existing token pool, e.g. the process-wide one.
    pub fn with_allocator(local: ExecutionEnvironment, allocator: Arc<TokenAllocator>) -> Self {
        info!(
            environment = %local.id(),
            max_tokens = allocator.max_tokens(),
            "Cluster coordinator started"
        );
        Self {
            local: Arc::new(ExecutionSite::new(local, allocator)),
            connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The environment this coordinator runs local work in.
    pub fn local_environment(&self) -> &ExecutionEnvironment {
        self.local.environment()
    }

    /// Token pool and inner task engine of the local environment.
    pub fn local_site(&self) -> &Arc<ExecutionSite> {
        &self.local
    }

    // ── Connections ──────────────────────────────────────────

    /// Open a mailbox for a cluster and serve it with `invoker` on a
    /// dedicated thread. When `run` returns the mailbox is closed, with the
    /// returned error as cause.
    pub fn connect(
        &self,
        environment: EnvironmentId,
        invoker: Arc<dyn TaskInvoker>,
    ) -> Result<Arc<Mailbox>, ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Task(TaskError::Interrupted));
        }
        let mut connections = lock(&self.connections);
        if connections
            .iter()
            .any(|c| c.mailbox.environment_id() == environment && !c.mailbox.is_closed())
        {
            return Err(ClusterError::Task(TaskError::failed(format!(
                "cluster {environment} is already connected"
            ))));
        }
        let mailbox = Arc::new(Mailbox::new(environment));
        let served = Arc::clone(&mailbox);
        let thread = thread::Builder::new()
            .name(format!("cluster-invoker-{}", environment.short()))
            .spawn(move || match invoker.run(&served) {
                Ok(()) => served.close(None),
                Err(e) => {
                    warn!(environment = %served.environment_id(), error = %e, "cluster invoker failed");
                    served.close(Some(e));
                }
            })
            .map_err(|e| {
                ClusterError::Task(TaskError::failed(format!(
                    "failed to start invoker thread for {environment}: {e}"
                )))
            })?;
        connections.push(Connection {
            mailbox: Arc::clone(&mailbox),
            thread: Some(thread),
        });
        info!(environment = %environment, "Cluster connected");
        Ok(mailbox)
    }

    /// Break the link to a cluster from this side. Its queued and in-flight
    /// events fail with the given reason.
    pub fn disconnect(&self, environment: EnvironmentId, reason: impl Into<String>) -> bool {
        let mailbox = lock(&self.connections)
            .iter()
            .find(|c| c.mailbox.environment_id() == environment && !c.mailbox.is_closed())
            .map(|c| Arc::clone(&c.mailbox));
        let Some(mailbox) = mailbox else {
            return false;
        };
        mailbox.close(Some(ClusterError::Disconnected {
            environment,
            reason: reason.into(),
        }));
        true
    }

    /// Environments with an open mailbox.
    pub fn cluster_ids(&self) -> Vec<EnvironmentId> {
        self.open_mailboxes()
            .iter()
            .map(|m| m.environment_id())
            .collect()
    }

    fn open_mailboxes(&self) -> Vec<Arc<Mailbox>> {
        lock(&self.connections)
            .iter()
            .filter(|c| !c.mailbox.is_closed())
            .map(|c| Arc::clone(&c.mailbox))
            .collect()
    }

    // ── Environment selection ──────────────────────────────────────────

    /// Find an environment suitable for `factory`. The local environment is
    /// tried first; clusters are only asked if it is unsuitable.
    pub fn select_environment<R, F>(
        &self,
        factory: &F,
        allowed: Option<&BTreeSet<EnvironmentId>>,
    ) -> SelectionFuture
    where
        F: TaskFactory<R> + ?Sized,
    {
        let selector = factory.environment_selector();
        let local_id = self.local.environment_id();
        let is_allowed = |id: EnvironmentId| allowed.map_or(true, |set| set.contains(&id));

        let local_cause = if is_allowed(local_id) {
            match selector.is_suitable(&self.local.environment().view()) {
                Ok(Some(selection)) => {
                    debug!(task = %factory.name(), "local environment selected");
                    return SelectionFuture::ready(Ok(SelectionResult::new(local_id, selection)));
                }
                Ok(None) => ClusterError::Unsuitable {
                    environment: local_id,
                },
                Err(e) => ClusterError::Task(e),
            }
        } else {
            ClusterError::NotAllowed {
                environment: local_id,
            }
        };

        let mailboxes: Vec<_> = if factory.has_capability(Capability::RemoteDispatchable)
            && !selector.restricted_to_local()
        {
            self.open_mailboxes()
                .into_iter()
                .filter(|m| is_allowed(m.environment_id()))
                .collect()
        } else {
            Vec::new()
        };

        let request = SelectionRequest::new(selector, Some(local_cause), mailboxes.len());
        for mailbox in &mailboxes {
            let event = SelectionEvent::new(Arc::clone(&request), mailbox.environment_id());
            mailbox.post(InvocationEvent::SelectEnvironment(Arc::new(event)));
        }
        request.outcome()
    }

    // ── Single task ──────────────────────────────────────────

    /// Run one task in the selected environment or any environment that
    /// satisfies the same qualifiers. Clusters race for the task; the local
    /// environment is the fallback when none of them could start it.
    pub fn invoke_task<R: Send + 'static>(
        &self,
        factory: Arc<dyn TaskFactory<R>>,
        selection: &SelectionResult,
    ) -> Result<TaskOutcome<R>, ClusterError> {
        let local_id = self.local.environment_id();
        let local_suitable = selection.qualifies(self.local.environment());

        if local_suitable && factory.has_capability(Capability::PrefersLocalEnvironment) {
            return Ok(self.run_locally(factory.as_ref()));
        }

        let mailboxes = if factory.has_capability(Capability::RemoteDispatchable) {
            self.open_mailboxes()
        } else {
            Vec::new()
        };
        let local_unsuitable = || ClusterError::Unsuitable {
            environment: local_id,
        };
        if mailboxes.is_empty() {
            return if local_suitable {
                Ok(self.run_locally(factory.as_ref()))
            } else {
                Err(ClusterError::ClusterTaskExecutionFailed {
                    environment: None,
                    causes: vec![local_unsuitable()],
                })
            };
        }

        let request = TaskRequest::new(Arc::clone(&factory), selection.clone(), mailboxes.len());
        for mailbox in &mailboxes {
            let event = TaskEvent::new(Arc::clone(&request), mailbox.environment_id());
            mailbox.post(InvocationEvent::ExecuteTask(Arc::new(event)));
        }
        match request.wait() {
            RaceEnd::Finished(outcome) => outcome,
            RaceEnd::AllFailed(mut causes) => {
                if local_suitable && request.try_start(local_id).is_ok() {
                    info!(
                        task = %factory.name(),
                        failed_clusters = causes.len(),
                        "No cluster started the task; running it locally"
                    );
                    return Ok(self.run_locally(factory.as_ref()));
                }
                if !local_suitable {
                    causes.insert(0, local_unsuitable());
                }
                Err(ClusterError::ClusterTaskExecutionFailed {
                    environment: None,
                    causes,
                })
            }
        }
    }

    fn run_locally<R>(&self, factory: &dyn TaskFactory<R>) -> TaskOutcome<R> {
        let count = factory.requested_computation_token_count();
        let token = self.local.allocator().request(&AllocatorKey::new(), count);
        let outcome = run_task(factory, &TaskContext::local(self.local.environment_id()));
        token.close();
        outcome
    }

    // ── Inner tasks ──────────────────────────────────────────

    /// Start an inner task in every target environment and merge their
    /// results.
    pub fn invoke_inner_task<R: Send + 'static>(
        &self,
        factory: Arc<dyn TaskFactory<R>>,
        selection: &SelectionResult,
        parameters: InnerTaskParameters,
    ) -> Result<InnerTaskResults<R>, ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Task(TaskError::Interrupted));
        }
        let local_id = self.local.environment_id();
        let fan_out = parameters.fans_out();
        let cancellable = parameters.duplication_cancellable;
        let allowed = parameters.allowed_environments.clone();
        let is_allowed = |id: EnvironmentId| allowed.as_ref().map_or(true, |set| set.contains(&id));

        let results = ResultsShared::new(factory.name());
        let request = InnerRequest::new(
            Arc::clone(&factory),
            selection.clone(),
            parameters,
            Arc::clone(&results),
        );

        let mut started_locally = false;
        if fan_out || selection.environment_id == local_id {
            if !is_allowed(local_id) {
                results.start_failed(ClusterError::NotAllowed {
                    environment: local_id,
                });
            } else if !selection.qualifies(self.local.environment()) {
                results.start_failed(ClusterError::Unsuitable {
                    environment: local_id,
                });
            } else if request.claim() {
                match request.start_contributor(self.local.manager(), false) {
                    Ok((contributor, handle)) => {
                        started_locally = true;
                        results.attach(contributor, handle, false);
                    }
                    Err(e) => {
                        request.refund();
                        results.start_failed(ClusterError::Task(e));
                    }
                }
            }
        }

        let remote = factory.has_capability(Capability::RemoteDispatchable)
            && !(started_locally && factory.has_capability(Capability::PrefersLocalEnvironment));
        let targets: Vec<_> = if remote {
            self.open_mailboxes()
                .into_iter()
                .filter(|m| is_allowed(m.environment_id()))
                .filter(|m| fan_out || m.environment_id() == selection.environment_id)
                .collect()
        } else {
            Vec::new()
        };

        if !fan_out && selection.environment_id != local_id && targets.is_empty() {
            let environment = selection.environment_id;
            results.start_failed(if !remote {
                ClusterError::Task(TaskError::failed(format!(
                    "{} cannot run in remote environment {environment}",
                    factory.name()
                )))
            } else if !is_allowed(environment) {
                ClusterError::NotAllowed { environment }
            } else {
                ClusterError::MailboxClosed {
                    environment,
                    reason: Some("not connected".into()),
                }
            });
        }

        for mailbox in &targets {
            results.expect_event();
            let event = InnerTaskEvent::new(Arc::clone(&request), mailbox.environment_id());
            mailbox.post(InvocationEvent::ExecuteInnerTask(Arc::new(event)));
        }
        debug!(
            task = %factory.name(),
            local = started_locally,
            clusters = targets.len(),
            "inner task dispatched"
        );
        Ok(InnerTaskResults::new(results, cancellable))
    }

    // ── Shutdown ──────────────────────────────────────────

    /// Close every mailbox, join the polling threads and stop local inner tasks.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<Connection> = lock(&self.connections).drain(..).collect();
        for connection in &connections {
            connection.mailbox.close(None);
        }
        for mut connection in connections {
            if let Some(thread) = connection.thread.take() {
                if thread.join().is_err() {
                    warn!(
                        environment = %connection.mailbox.environment_id(),
                        "cluster invoker thread panicked"
                    );
                }
            }
        }
        self.local.close();
        info!("Cluster coordinator closed");
    }
}

impl Drop for ClusterCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}
