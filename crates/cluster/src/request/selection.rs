//! Environment selection: first successful response wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_core::sync::{lock, OnceLatch};
use kiln_core::{
    EnvironmentId, EnvironmentSelection, ExecutionEnvironment, SelectionResult, SharedSelector,
};
use tracing::debug;

use crate::error::ClusterError;
use crate::event::EventControl;

type SelectionOutcome = Result<SelectionResult, ClusterError>;

struct SelectionState {
    open: usize,
    local: Option<Box<ClusterError>>,
    failures: Vec<ClusterError>,
}

pub struct SelectionRequest {
    selector: SharedSelector,
    outcome: Arc<OnceLatch<SelectionOutcome>>,
    state: Mutex<SelectionState>,
}

impl SelectionRequest {
    /// `local` is why the local environment was not selected.
    pub fn new(selector: SharedSelector, local: Option<ClusterError>, candidates: usize) -> Arc<Self> {
        let request = Arc::new(Self {
            selector,
            outcome: Arc::new(OnceLatch::new()),
            state: Mutex::new(SelectionState {
                open: candidates,
                local: local.map(Box::new),
                failures: Vec::new(),
            }),
        });
        if candidates == 0 {
            request.finish_failed();
        }
        request
    }

    pub fn outcome(&self) -> SelectionFuture {
        SelectionFuture {
            outcome: Arc::clone(&self.outcome),
        }
    }

    fn succeed(&self, environment: EnvironmentId, selection: EnvironmentSelection) {
        if self.outcome.set(Ok(SelectionResult::new(environment, selection))) {
            debug!(environment = %environment, "environment selected");
        }
        self.close_context(None);
    }

    fn close_context(&self, failure: Option<ClusterError>) {
        let mut state = lock(&self.state);
        if let Some(cause) = failure {
            state.failures.push(cause);
        }
        state.open = state.open.saturating_sub(1);
        let exhausted = state.open == 0;
        drop(state);
        if exhausted {
            self.finish_failed();
        }
    }

    /// No-op if some candidate already succeeded.
    fn finish_failed(&self) {
        let mut state = lock(&self.state);
        let error = ClusterError::EnvironmentSelectionFailed {
            local: state.local.take(),
            remote: std::mem::take(&mut state.failures),
        };
        drop(state);
        self.outcome.set(Err(error));
    }
}

/// One mailbox's share of a selection request.
pub struct SelectionEvent {
    request: Arc<SelectionRequest>,
    environment_id: EnvironmentId,
    resolved: AtomicBool,
}

impl SelectionEvent {
    pub fn new(request: Arc<SelectionRequest>, environment_id: EnvironmentId) -> Self {
        Self {
            request,
            environment_id,
            resolved: AtomicBool::new(false),
        }
    }

    pub fn environment_id(&self) -> EnvironmentId {
        self.environment_id
    }

    pub fn selector(&self) -> &SharedSelector {
        &self.request.selector
    }

    /// Run the selector against `environment` and respond accordingly.
    pub fn evaluate(&self, environment: &ExecutionEnvironment) {
        match self.request.selector.is_suitable(&environment.view()) {
            Ok(Some(selection)) => self.succeed(selection),
            Ok(None) => self.fail_unsuitable(),
            Err(e) => self.fail(ClusterError::Task(e)),
        }
    }

    pub fn succeed(&self, selection: EnvironmentSelection) {
        if self.resolve() {
            self.request.succeed(self.environment_id, selection);
        }
    }

    pub fn fail_unsuitable(&self) {
        self.fail(ClusterError::Unsuitable {
            environment: self.environment_id,
        });
    }

    fn resolve(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }
}

impl EventControl for SelectionEvent {
    fn is_active(&self) -> bool {
        !self.resolved.load(Ordering::Acquire) && !self.request.outcome.is_set()
    }

    fn is_finished(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    fn fail(&self, cause: ClusterError) {
        if self.resolve() {
            self.request.close_context(Some(cause));
        }
    }

    fn dismiss(&self) {
        if self.resolve() {
            self.request.close_context(None);
        }
    }
}

/// Pending or completed environment selection.
#[derive(Clone)]
pub struct SelectionFuture {
    outcome: Arc<OnceLatch<SelectionOutcome>>,
}

impl SelectionFuture {
    pub fn ready(outcome: SelectionOutcome) -> Self {
        Self {
            outcome: Arc::new(OnceLatch::with_value(outcome)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_set()
    }

    pub fn try_get(&self) -> Option<SelectionOutcome> {
        self.outcome.get()
    }

    /// Block until a candidate succeeded or every candidate failed.
    pub fn wait(&self) -> SelectionOutcome {
        self.outcome
            .wait()
            .unwrap_or_else(|| Err(ClusterError::Task(kiln_core::TaskError::Interrupted)))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<SelectionOutcome> {
        self.outcome.wait_timeout(timeout)
    }
}
