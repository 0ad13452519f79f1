//! Merged view over every engine contributing to one inner task.
//!
//! Lock order: the merge state, then a contributor's state, then the
//! contributor's handle. Engine threads only ever take one of them at a time.

use std::sync::{Arc, Condvar, Mutex, Weak};

use kiln_compute::{InnerTaskHandle, InnerTaskListener, InnerTaskResult, InvocationCounts};
use kiln_core::sync::{lock, wait};
use kiln_core::EnvironmentId;
use tracing::{debug, warn};

use crate::error::ClusterError;

// ── Contributors ──────────────────────────────────────────

struct ContributorState<R> {
    handle: Option<InnerTaskHandle<R>>,
    /// The engine reported that it finished.
    ended: bool,
    /// Not yet handed out by `next`.
    failure: Option<ClusterError>,
    failed: bool,
}

enum Step<R> {
    Ready(InnerTaskResult<R>),
    Idle,
    Drained,
}

/// One environment's engine, seen from the coordinator.
pub(crate) struct Contributor<R> {
    environment: EnvironmentId,
    merge: Weak<ResultsShared<R>>,
    state: Mutex<ContributorState<R>>,
}

impl<R: Send + 'static> Contributor<R> {
    pub(crate) fn new(environment: EnvironmentId, merge: &Arc<ResultsShared<R>>) -> Arc<Self> {
        Arc::new(Self {
            environment,
            merge: Arc::downgrade(merge),
            state: Mutex::new(ContributorState {
                handle: None,
                ended: false,
                failure: None,
                failed: false,
            }),
        })
    }

    pub(crate) fn environment(&self) -> EnvironmentId {
        self.environment
    }

    fn set_handle(&self, handle: InnerTaskHandle<R>) {
        let mut state = lock(&self.state);
        if state.failed || state.failure.is_some() {
            handle.interrupt();
        }
        state.handle = Some(handle);
    }

    /// Engine ended or the contributor failed; nothing more will arrive.
    pub(crate) fn is_done(&self) -> bool {
        let state = lock(&self.state);
        state.ended || state.failed || state.failure.is_some()
    }

    fn counts(&self) -> Option<InvocationCounts> {
        lock(&self.state).handle.as_ref().map(InnerTaskHandle::counts)
    }

    fn next_step(&self) -> Step<R> {
        let mut state = lock(&self.state);
        if let Some(failure) = state.failure.take() {
            state.failed = true;
            return Step::Ready(InnerTaskResult::Failed(
                failure.into_task_error(self.environment),
            ));
        }
        if state.failed {
            return Step::Drained;
        }
        let ended = state.ended;
        let Some(handle) = &state.handle else {
            return Step::Idle;
        };
        match handle.take_result() {
            Some(result) => Step::Ready(result),
            None if ended => Step::Drained,
            None => Step::Idle,
        }
    }

    /// The link to this contributor broke. Reported once as a failed result;
    /// results it had not delivered yet are dropped.
    pub(crate) fn fail(&self, cause: ClusterError) {
        let mut state = lock(&self.state);
        if state.ended || state.failed || state.failure.is_some() {
            debug!(environment = %self.environment, error = %cause, "ignoring failure of an ended contributor");
            return;
        }
        warn!(environment = %self.environment, error = %cause, "inner task contributor failed");
        if let Some(handle) = &state.handle {
            handle.interrupt();
        }
        state.failure = Some(cause);
        drop(state);
        self.wake();
    }

    fn cancel_duplication(&self) {
        if let Some(handle) = &lock(&self.state).handle {
            handle.cancel_duplication();
        }
    }

    fn interrupt(&self) {
        if let Some(handle) = &lock(&self.state).handle {
            handle.interrupt();
        }
    }

    fn wake(&self) {
        if let Some(merge) = self.merge.upgrade() {
            merge.wake();
        }
    }
}

impl<R: Send + 'static> InnerTaskListener for Contributor<R> {
    fn notify_invocation_start(&self) -> bool {
        let state = lock(&self.state);
        !state.failed && state.failure.is_none()
    }

    fn notify_result_ready(&self) {
        self.wake();
    }

    fn notify_finished(&self, counts: InvocationCounts) {
        lock(&self.state).ended = true;
        debug!(
            environment = %self.environment,
            invoked = counts.invoked,
            "inner task contributor finished"
        );
        self.wake();
    }
}

// ── Merge state ──────────────────────────────────────────

struct MergeState<R> {
    contributors: Vec<Arc<Contributor<R>>>,
    /// Posted events that have neither started a contributor nor failed.
    open_events: usize,
    failures: Vec<ClusterError>,
    init_reported: bool,
    /// Rotates the contributor polled first.
    cursor: usize,
    cancelled: bool,
    interrupted: bool,
}

pub(crate) struct ResultsShared<R> {
    name: String,
    state: Mutex<MergeState<R>>,
    changed: Condvar,
}

impl<R: Send + 'static> ResultsShared<R> {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(MergeState {
                contributors: Vec::new(),
                open_events: 0,
                failures: Vec::new(),
                init_reported: false,
                cursor: 0,
                cancelled: false,
                interrupted: false,
            }),
            changed: Condvar::new(),
        })
    }

    fn wake(&self) {
        let _state = lock(&self.state);
        self.changed.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        let state = lock(&self.state);
        state.cancelled || state.interrupted
    }

    pub(crate) fn expect_event(&self) {
        lock(&self.state).open_events += 1;
    }

    pub(crate) fn event_dismissed(&self) {
        let mut state = lock(&self.state);
        state.open_events = state.open_events.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    pub(crate) fn event_failed(&self, cause: ClusterError) {
        debug!(task = %self.name, error = %cause, "inner task event failed");
        let mut state = lock(&self.state);
        state.open_events = state.open_events.saturating_sub(1);
        state.failures.push(cause);
        drop(state);
        self.changed.notify_all();
    }

    /// A contributor could not be started outside of any event.
    pub(crate) fn start_failed(&self, cause: ClusterError) {
        debug!(task = %self.name, error = %cause, "inner task contributor not started");
        lock(&self.state).failures.push(cause);
        self.changed.notify_all();
    }

    pub(crate) fn attach(
        &self,
        contributor: Arc<Contributor<R>>,
        handle: InnerTaskHandle<R>,
        from_event: bool,
    ) {
        let mut state = lock(&self.state);
        if from_event {
            state.open_events = state.open_events.saturating_sub(1);
        }
        if state.cancelled {
            handle.cancel_duplication();
        }
        if state.interrupted {
            handle.interrupt();
        }
        contributor.set_handle(handle);
        debug!(
            task = %self.name,
            environment = %contributor.environment(),
            "inner task contributor attached"
        );
        state.contributors.push(contributor);
        drop(state);
        self.changed.notify_all();
    }
}

// ── Public view ──────────────────────────────────────────

/// Results of an inner task from every environment it runs in.
pub struct InnerTaskResults<R> {
    shared: Arc<ResultsShared<R>>,
    cancellable: bool,
}

impl<R: Send + 'static> InnerTaskResults<R> {
    pub(crate) fn new(shared: Arc<ResultsShared<R>>, cancellable: bool) -> Self {
        Self {
            shared,
            cancellable,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Block until some contributor has a result. `Ok(None)` once every
    /// contributor ended and was drained. If no contributor could be started
    /// anywhere, the collected causes are reported once.
    pub fn next(&self) -> Result<Option<InnerTaskResult<R>>, ClusterError> {
        let mut state = lock(&self.shared.state);
        loop {
            let count = state.contributors.len();
            let mut pending = false;
            for i in 0..count {
                let index = (state.cursor + i) % count;
                match state.contributors[index].next_step() {
                    Step::Ready(result) => {
                        state.cursor = (index + 1) % count;
                        return Ok(Some(result));
                    }
                    Step::Idle => pending = true,
                    Step::Drained => {}
                }
            }
            if !pending && state.open_events == 0 {
                if count == 0 && !state.failures.is_empty() && !state.init_reported {
                    state.init_reported = true;
                    return Err(ClusterError::InnerTaskInitialization {
                        causes: state.failures.clone(),
                    });
                }
                return Ok(None);
            }
            state = wait(&self.shared.changed, state);
        }
    }

    /// Drain every remaining result.
    pub fn collect(&self) -> Result<Vec<InnerTaskResult<R>>, ClusterError> {
        let mut results = Vec::new();
        while let Some(result) = self.next()? {
            results.push(result);
        }
        Ok(results)
    }

    /// Stop starting invocations everywhere; running ones complete normally.
    /// Ignored when the parameters made duplication non-cancellable.
    pub fn cancel_duplication(&self) -> bool {
        if !self.cancellable {
            debug!(task = %self.shared.name, "duplication is not cancellable");
            return false;
        }
        let mut state = lock(&self.shared.state);
        state.cancelled = true;
        for contributor in &state.contributors {
            contributor.cancel_duplication();
        }
        drop(state);
        self.shared.changed.notify_all();
        true
    }

    pub fn interrupt(&self) {
        let mut state = lock(&self.shared.state);
        state.interrupted = true;
        for contributor in &state.contributors {
            contributor.interrupt();
        }
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Block until no contributor can produce anything anymore. Results are
    /// not consumed. Returns the summed invocation counts.
    pub fn wait_finish(&self) -> InvocationCounts {
        let mut state = lock(&self.shared.state);
        while state.open_events > 0 || !state.contributors.iter().all(|c| c.is_done()) {
            state = wait(&self.shared.changed, state);
        }
        state
            .contributors
            .iter()
            .filter_map(|c| c.counts())
            .fold(
                InvocationCounts {
                    last_result_sent: true,
                    ..InvocationCounts::default()
                },
                |total, c| InvocationCounts {
                    invoked: total.invoked + c.invoked,
                    results: total.results + c.results,
                    last_result_sent: total.last_result_sent && c.last_result_sent,
                },
            )
    }

    pub fn contributor_count(&self) -> usize {
        lock(&self.shared.state).contributors.len()
    }

    /// Environments that have contributed so far.
    pub fn contributors(&self) -> Vec<EnvironmentId> {
        lock(&self.shared.state)
            .contributors
            .iter()
            .map(|c| c.environment())
            .collect()
    }
}

impl<R> std::fmt::Debug for InnerTaskResults<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerTaskResults")
            .field("name", &self.shared.name)
            .field("cancellable", &self.cancellable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use kiln_compute::{InnerTaskManager, InnerTaskRequest, TokenAllocator};
    use kiln_core::{FnTaskFactory, TaskError, TaskFactory};

    fn manager() -> InnerTaskManager {
        InnerTaskManager::new(Arc::new(TokenAllocator::new(4)), EnvironmentId::new())
    }

    fn start(
        manager: &InnerTaskManager,
        shared: &Arc<ResultsShared<u32>>,
        value: u32,
    ) -> Arc<Contributor<u32>> {
        let factory: Arc<dyn TaskFactory<u32>> =
            Arc::new(FnTaskFactory::new("value", move |_| Ok(value)));
        let contributor = Contributor::new(manager.environment_id(), shared);
        let listener: Arc<dyn InnerTaskListener> = contributor.clone();
        let handle = manager
            .invoke_inner_task(InnerTaskRequest::new(factory).with_listener(listener))
            .unwrap();
        shared.attach(Arc::clone(&contributor), handle, false);
        contributor
    }

    #[test]
    fn merges_results_from_every_contributor() {
        let (a, b) = (manager(), manager());
        let shared = ResultsShared::new("value");
        start(&a, &shared, 1);
        start(&b, &shared, 2);
        let results = InnerTaskResults::new(shared, true);

        let mut values: Vec<u32> = results
            .collect()
            .unwrap()
            .into_iter()
            .map(|r| r.into_result().unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, [1, 2]);
        assert_eq!(results.wait_finish().invoked, 2);
    }

    #[test]
    fn waits_for_open_events() {
        let shared = ResultsShared::<u32>::new("value");
        shared.expect_event();
        let results = InnerTaskResults::new(Arc::clone(&shared), true);

        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            shared.event_dismissed();
        });
        assert!(results.next().unwrap().is_none());
        late.join().unwrap();
    }

    #[test]
    fn initialization_failure_is_reported_once() {
        let shared = ResultsShared::<u32>::new("value");
        let env = EnvironmentId::new();
        shared.expect_event();
        shared.event_failed(ClusterError::Unsuitable { environment: env });
        shared.start_failed(ClusterError::Task(TaskError::failed("no local engine")));
        let results = InnerTaskResults::new(shared, true);

        match results.next() {
            Err(ClusterError::InnerTaskInitialization { causes }) => assert_eq!(causes.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(results.next().unwrap().is_none());
    }

    #[test]
    fn failed_contributor_reports_one_failure() {
        let shared = ResultsShared::<u32>::new("value");
        let env = EnvironmentId::new();
        let contributor = Contributor::new(env, &shared);
        contributor.fail(ClusterError::Disconnected {
            environment: env,
            reason: "cable pulled".into(),
        });
        let manager = manager();
        let factory: Arc<dyn TaskFactory<u32>> = Arc::new(FnTaskFactory::new("value", |_| Ok(7)));
        let handle = manager
            .invoke_inner_task(InnerTaskRequest::new(factory))
            .unwrap();
        shared.attach(Arc::clone(&contributor), handle, false);
        let results = InnerTaskResults::new(shared, true);

        let first = results.next().unwrap().unwrap();
        assert!(matches!(first, InnerTaskResult::Failed(TaskError::Remote { .. })));
        assert!(results.next().unwrap().is_none());
        assert!(contributor.is_done());
    }

    #[test]
    fn non_cancellable_results_ignore_cancel() {
        let shared = ResultsShared::<u32>::new("value");
        let results = InnerTaskResults::new(shared, false);
        assert!(!results.cancel_duplication());
    }
}
