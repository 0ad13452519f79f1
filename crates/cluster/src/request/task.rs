//! Single-task dispatch: every candidate races for `start_execution`, the
//! first one wins and the rest are failed with `LostRace`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kiln_compute::{run_task, AllocatorKey, ComputationToken, TokenAllocator};
use kiln_core::sync::{lock, wait};
use kiln_core::{EnvironmentId, SelectionResult, TaskContext, TaskError, TaskFactory};
use tracing::{debug, info};

use crate::error::ClusterError;
use crate::event::{EventControl, TaskExecutionEvent};
use crate::site::ExecutionSite;

/// Result of a task body; `Err` is a captured failure, not a dispatch error.
pub type TaskOutcome<R> = Result<R, TaskError>;

pub(crate) enum RaceEnd<R> {
    /// The winner reported, or failed after starting.
    Finished(Result<TaskOutcome<R>, ClusterError>),
    /// Nobody started; the causes of every candidate.
    AllFailed(Vec<ClusterError>),
}

struct RaceState<R> {
    open: usize,
    starter: Option<EnvironmentId>,
    outcome: Option<Result<TaskOutcome<R>, ClusterError>>,
    failures: Vec<ClusterError>,
}

pub(crate) struct TaskRequest<R> {
    factory: Arc<dyn TaskFactory<R>>,
    selection: SelectionResult,
    state: Mutex<RaceState<R>>,
    changed: Condvar,
    /// Allocators that candidates may be blocked on while the race runs.
    token_pools: Mutex<Vec<Arc<TokenAllocator>>>,
}

impl<R: Send + 'static> TaskRequest<R> {
    pub(crate) fn new(
        factory: Arc<dyn TaskFactory<R>>,
        selection: SelectionResult,
        candidates: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            selection,
            state: Mutex::new(RaceState {
                open: candidates,
                starter: None,
                outcome: None,
                failures: Vec::new(),
            }),
            changed: Condvar::new(),
            token_pools: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn factory(&self) -> &Arc<dyn TaskFactory<R>> {
        &self.factory
    }

    pub(crate) fn is_started(&self) -> bool {
        lock(&self.state).starter.is_some()
    }

    pub(crate) fn try_start(&self, environment: EnvironmentId) -> Result<(), ClusterError> {
        let mut state = lock(&self.state);
        match state.starter {
            None => {
                state.starter = Some(environment);
                drop(state);
                self.wake_token_waiters();
                info!(task = %self.factory.name(), environment = %environment, "task started");
                Ok(())
            }
            Some(starter) if starter == environment => Ok(()),
            Some(_) => Err(ClusterError::LostRace { environment }),
        }
    }

    fn register_token_pool(&self, allocator: &Arc<TokenAllocator>) {
        let mut pools = lock(&self.token_pools);
        if !pools.iter().any(|p| Arc::ptr_eq(p, allocator)) {
            pools.push(Arc::clone(allocator));
        }
    }

    /// Candidates waiting for tokens re-check whether the race is still open.
    fn wake_token_waiters(&self) {
        let pools = lock(&self.token_pools).clone();
        for pool in pools {
            pool.wake_up_waiters();
        }
    }

    fn complete(&self, environment: EnvironmentId, outcome: TaskOutcome<R>) {
        let mut state = lock(&self.state);
        assert_eq!(
            state.starter,
            Some(environment),
            "task result reported by an environment that did not start it"
        );
        state.open = state.open.saturating_sub(1);
        state.outcome.get_or_insert(Ok(outcome));
        drop(state);
        self.changed.notify_all();
    }

    fn context_failed(&self, environment: EnvironmentId, cause: ClusterError) {
        let mut state = lock(&self.state);
        state.open = state.open.saturating_sub(1);
        if state.starter == Some(environment) {
            if state.outcome.is_none() {
                state.outcome = Some(Err(ClusterError::ClusterTaskExecutionFailed {
                    environment: Some(environment),
                    causes: vec![cause],
                }));
            }
        } else {
            state.failures.push(cause);
        }
        drop(state);
        self.changed.notify_all();
    }

    fn context_dismissed(&self) {
        let mut state = lock(&self.state);
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    /// Block until the winner reports or every candidate failed to start.
    pub(crate) fn wait(&self) -> RaceEnd<R> {
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = state.outcome.take() {
                return RaceEnd::Finished(outcome);
            }
            if state.starter.is_none() && state.open == 0 {
                return RaceEnd::AllFailed(std::mem::take(&mut state.failures));
            }
            state = wait(&self.changed, state);
        }
    }
}

/// One mailbox's candidacy in a single-task race.
pub(crate) struct TaskEvent<R> {
    request: Arc<TaskRequest<R>>,
    environment_id: EnvironmentId,
    resolved: AtomicBool,
    interrupted: Arc<AtomicBool>,
}

impl<R: Send + 'static> TaskEvent<R> {
    pub(crate) fn new(request: Arc<TaskRequest<R>>, environment_id: EnvironmentId) -> Self {
        Self {
            request,
            environment_id,
            resolved: AtomicBool::new(false),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn resolve(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }

    fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    fn run_with(&self, site: &ExecutionSite, token: ComputationToken) {
        let ctx = TaskContext::new(site.environment_id(), true, Arc::clone(&self.interrupted));
        let outcome = run_task(self.request.factory().as_ref(), &ctx);
        token.close();
        if self.resolve() {
            self.request.complete(self.environment_id, outcome);
        } else {
            debug!(
                task = %self.request.factory().name(),
                environment = %self.environment_id,
                "dropping result of an already failed task event"
            );
        }
    }
}

impl<R: Send + 'static> EventControl for TaskEvent<R> {
    fn is_active(&self) -> bool {
        !self.is_resolved() && !self.request.is_started()
    }

    fn is_finished(&self) -> bool {
        self.is_resolved()
    }

    fn fail(&self, cause: ClusterError) {
        if self.resolve() {
            self.interrupted.store(true, Ordering::Release);
            self.request.context_failed(self.environment_id, cause);
            self.request.wake_token_waiters();
        }
    }

    /// A candidate that went inactive because another environment started
    /// the task lost the race and is failed as such.
    fn dismiss(&self) {
        if self.request.is_started() {
            self.fail(ClusterError::LostRace {
                environment: self.environment_id,
            });
        } else if self.resolve() {
            self.request.context_dismissed();
        }
    }
}

impl<R: Send + 'static> TaskExecutionEvent for TaskEvent<R> {
    fn task_name(&self) -> &str {
        self.request.factory().name()
    }

    fn start_execution(&self) -> Result<(), ClusterError> {
        if self.is_resolved() {
            return Err(ClusterError::LostRace {
                environment: self.environment_id,
            });
        }
        self.request.try_start(self.environment_id)
    }

    fn run_started(&self, site: &ExecutionSite) {
        let count = self.request.factory().requested_computation_token_count();
        let token = site.allocator().request(&AllocatorKey::new(), count);
        self.run_with(site, token);
    }

    fn execute(&self, site: &ExecutionSite) {
        if !self.request.selection.qualifies(site.environment()) {
            self.fail(ClusterError::Unsuitable {
                environment: self.environment_id,
            });
            return;
        }
        let count = self.request.factory().requested_computation_token_count();
        self.request.register_token_pool(site.allocator());
        let token = site.allocator().request_abortable(&AllocatorKey::new(), count, &|| {
            self.is_resolved() || self.request.is_started()
        });
        let Some(token) = token else {
            self.fail(ClusterError::LostRace {
                environment: self.environment_id,
            });
            return;
        };
        match self.start_execution() {
            Ok(()) => self.run_with(site, token),
            Err(e) => self.fail(e),
        }
    }
}
