//! Inner-task dispatch: every target environment may start a contributing
//! engine, up to the request's contributor budget.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use kiln_compute::{InnerTaskHandle, InnerTaskListener, InnerTaskManager, InnerTaskRequest};
use kiln_core::sync::lock;
use kiln_core::{EnvironmentId, SelectionResult, TaskError, TaskFactory};
use tracing::debug;

use crate::error::ClusterError;
use crate::event::{EventControl, InnerTaskExecutionEvent};
use crate::parameters::{InnerTaskParameters, PredicateSource};
use crate::results::{Contributor, ResultsShared};
use crate::site::ExecutionSite;

pub(crate) struct InnerRequest<R> {
    factory: Arc<dyn TaskFactory<R>>,
    selection: SelectionResult,
    max_environment_factor: i32,
    predicates: PredicateSource,
    /// Contributors that may still start; negative is unlimited.
    budget: AtomicI64,
    results: Arc<ResultsShared<R>>,
}

impl<R: Send + 'static> InnerRequest<R> {
    pub(crate) fn new(
        factory: Arc<dyn TaskFactory<R>>,
        selection: SelectionResult,
        parameters: InnerTaskParameters,
        results: Arc<ResultsShared<R>>,
    ) -> Arc<Self> {
        let budget = parameters
            .contributor_budget()
            .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        Arc::new(Self {
            factory,
            selection,
            max_environment_factor: parameters.max_environment_factor,
            predicates: parameters.duplication.into_source(),
            budget: AtomicI64::new(budget),
            results,
        })
    }

    pub(crate) fn selection(&self) -> &SelectionResult {
        &self.selection
    }

    pub(crate) fn results(&self) -> &Arc<ResultsShared<R>> {
        &self.results
    }

    /// Reserve a contributor slot.
    pub(crate) fn claim(&self) -> bool {
        self.budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| match b {
                b if b < 0 => Some(b),
                0 => None,
                b => Some(b - 1),
            })
            .is_ok()
    }

    /// Give back a slot reserved by [`claim`](Self::claim) whose contributor
    /// never started.
    pub(crate) fn refund(&self) {
        match self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| (b >= 0).then(|| b + 1))
        {
            Ok(previous) => debug!(
                task = %self.factory.name(),
                budget = previous + 1,
                "contributor slot returned"
            ),
            // Unlimited budgets never reserve anything.
            Err(unlimited) => debug_assert!(unlimited < 0),
        }
    }

    pub(crate) fn accepts_new_contributors(&self) -> bool {
        self.budget.load(Ordering::Acquire) != 0 && !self.results.is_stopped()
    }

    /// Start an engine in `manager`'s environment that reports into the
    /// merged results.
    pub(crate) fn start_contributor(
        &self,
        manager: &InnerTaskManager,
        remote: bool,
    ) -> Result<(Arc<Contributor<R>>, InnerTaskHandle<R>), TaskError> {
        let contributor = Contributor::new(manager.environment_id(), &self.results);
        let listener: Arc<dyn InnerTaskListener> = contributor.clone();
        let mut request = InnerTaskRequest::new(Arc::clone(&self.factory))
            .with_max_environment_factor(self.max_environment_factor)
            .with_listener(listener)
            .remote(remote);
        if let Some(predicate) = self.predicates.for_contributor() {
            request = request.with_predicate(predicate);
        }
        let handle = manager.invoke_inner_task(request)?;
        Ok((contributor, handle))
    }
}

struct EventState<R> {
    responded: bool,
    contributor: Option<Arc<Contributor<R>>>,
}

/// One mailbox's offer to contribute to an inner task.
pub(crate) struct InnerTaskEvent<R> {
    request: Arc<InnerRequest<R>>,
    environment_id: EnvironmentId,
    state: Mutex<EventState<R>>,
    /// Set the first time the event reports inactive. A refunded slot does
    /// not revive it.
    inactive: AtomicBool,
}

impl<R: Send + 'static> InnerTaskEvent<R> {
    pub(crate) fn new(request: Arc<InnerRequest<R>>, environment_id: EnvironmentId) -> Self {
        Self {
            request,
            environment_id,
            state: Mutex::new(EventState {
                responded: false,
                contributor: None,
            }),
            inactive: AtomicBool::new(false),
        }
    }

    fn is_responded(&self) -> bool {
        lock(&self.state).responded
    }

    /// The engine started; results flow through `contributor` from now on.
    pub(crate) fn set_invocation_handle(
        &self,
        contributor: Arc<Contributor<R>>,
        handle: InnerTaskHandle<R>,
    ) {
        let mut state = lock(&self.state);
        if state.responded {
            drop(state);
            debug!(
                task = %self.request.factory.name(),
                environment = %self.environment_id,
                "event failed while the engine started; interrupting it"
            );
            handle.interrupt();
            self.request.refund();
            return;
        }
        state.responded = true;
        state.contributor = Some(Arc::clone(&contributor));
        drop(state);
        self.request.results().attach(contributor, handle, true);
    }

    pub(crate) fn fail_invocation_start(&self, cause: ClusterError) {
        let mut state = lock(&self.state);
        if state.responded {
            return;
        }
        state.responded = true;
        drop(state);
        self.request.results().event_failed(cause);
    }
}

impl<R: Send + 'static> EventControl for InnerTaskEvent<R> {
    fn is_active(&self) -> bool {
        if self.inactive.load(Ordering::Acquire) {
            return false;
        }
        if !self.is_responded() && self.request.accepts_new_contributors() {
            return true;
        }
        self.inactive.store(true, Ordering::Release);
        false
    }

    fn is_finished(&self) -> bool {
        let state = lock(&self.state);
        state.responded && state.contributor.as_ref().map_or(true, |c| c.is_done())
    }

    fn fail(&self, cause: ClusterError) {
        let mut state = lock(&self.state);
        if !state.responded {
            state.responded = true;
            drop(state);
            self.request.results().event_failed(cause);
            return;
        }
        let contributor = state.contributor.clone();
        drop(state);
        if let Some(contributor) = contributor {
            contributor.fail(cause);
        }
    }

    fn dismiss(&self) {
        let mut state = lock(&self.state);
        if state.responded {
            return;
        }
        state.responded = true;
        drop(state);
        self.request.results().event_dismissed();
    }
}

impl<R: Send + 'static> InnerTaskExecutionEvent for InnerTaskEvent<R> {
    fn task_name(&self) -> &str {
        self.request.factory.name()
    }

    fn execute(&self, site: &ExecutionSite) {
        if self.is_responded() {
            return;
        }
        if !self.request.selection().qualifies(site.environment()) {
            self.fail_invocation_start(ClusterError::Unsuitable {
                environment: self.environment_id,
            });
            return;
        }
        if !self.request.claim() {
            self.dismiss();
            return;
        }
        match self.request.start_contributor(site.manager(), true) {
            Ok((contributor, handle)) => self.set_invocation_handle(contributor, handle),
            Err(e) => {
                self.request.refund();
                self.fail_invocation_start(ClusterError::Task(e));
            }
        }
    }
}
