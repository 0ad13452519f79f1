use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kiln_core::sync::{lock, OnceLatch};
use kiln_core::TaskError;

use super::counter::{InvocationCounter, InvocationCounts};
use crate::token::TokenAllocator;

/// Outcome of a single inner task invocation.
#[derive(Debug, PartialEq)]
pub enum InnerTaskResult<R> {
    Completed(R),
    Failed(TaskError),
}

impl<R> InnerTaskResult<R> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn into_result(self) -> Result<R, TaskError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(e) => Err(e),
        }
    }
}

impl<R> From<Result<R, TaskError>> for InnerTaskResult<R> {
    fn from(result: Result<R, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(e) => Self::Failed(e),
        }
    }
}

/// Observer of an inner task's progress, called from the executing threads.
pub trait InnerTaskListener: Send + Sync {
    /// Asked before every invocation; `false` refuses it.
    fn notify_invocation_start(&self) -> bool {
        true
    }

    /// One more result can be taken from the handle.
    fn notify_result_ready(&self) {}

    /// No invocation will start anymore and every result was posted.
    fn notify_finished(&self, _counts: InvocationCounts) {}
}

#[derive(Debug, Default)]
pub struct NoopListener;

impl InnerTaskListener for NoopListener {}

// ── Shared state ──────────────────────────────────────────

pub(crate) struct InvocationShared<R> {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) counter: InvocationCounter,
    results: Mutex<VecDeque<InnerTaskResult<R>>>,
    cancelled: AtomicBool,
    pub(crate) interrupted: Arc<AtomicBool>,
    finished: OnceLatch<InvocationCounts>,
    pub(crate) allocator: Arc<TokenAllocator>,
    pub(crate) listener: Arc<dyn InnerTaskListener>,
}

impl<R> InvocationShared<R> {
    pub(crate) fn new(
        id: u64,
        name: String,
        allocator: Arc<TokenAllocator>,
        listener: Arc<dyn InnerTaskListener>,
    ) -> Self {
        Self {
            id,
            name,
            counter: InvocationCounter::new(),
            results: Mutex::new(VecDeque::new()),
            cancelled: AtomicBool::new(false),
            interrupted: Arc::new(AtomicBool::new(false)),
            finished: OnceLatch::new(),
            allocator,
            listener,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.is_cancelled() || self.is_interrupted()
    }

    pub(crate) fn cancel_duplication(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.allocator.wake_up_waiters();
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.allocator.wake_up_waiters();
    }

    /// Begin an invocation if the listener accepts it.
    pub(crate) fn begin(&self) -> bool {
        if !self.counter.try_begin() {
            return false;
        }
        if !self.listener.notify_invocation_start() {
            self.counter.cancel_begin();
            return false;
        }
        true
    }

    /// Deliver the result of a begun invocation.
    pub(crate) fn post(&self, result: InnerTaskResult<R>) {
        lock(&self.results).push_back(result);
        self.counter.post_result();
        self.listener.notify_result_ready();
    }

    /// Report a failure that happened outside a running invocation.
    pub(crate) fn post_failure(&self, error: TaskError) {
        if self.begin() {
            self.post(InnerTaskResult::Failed(error));
        } else {
            tracing::warn!(task = %self.name, error = %error, "dropping failure of an ended inner task");
        }
    }

    pub(crate) fn finish(&self) -> InvocationCounts {
        let counts = self.counter.finish();
        self.listener.notify_finished(counts);
        self.finished.set(counts);
        counts
    }
}

// ── Handle ──────────────────────────────────────────

/// Caller-side view of an inner task invocation.
pub struct InnerTaskHandle<R> {
    pub(crate) shared: Arc<InvocationShared<R>>,
}

impl<R> Clone for InnerTaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R> InnerTaskHandle<R> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Next completed result, if any.
    pub fn take_result(&self) -> Option<InnerTaskResult<R>> {
        lock(&self.shared.results).pop_front()
    }

    pub fn drain_results(&self) -> Vec<InnerTaskResult<R>> {
        lock(&self.shared.results).drain(..).collect()
    }

    /// Blocks until every worker joined and the last result was posted.
    pub fn wait_finish(&self) -> InvocationCounts {
        self.shared
            .finished
            .wait()
            .unwrap_or_else(|| self.shared.counter.snapshot())
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.is_set()
    }

    /// Stop starting new invocations; running ones complete normally.
    pub fn cancel_duplication(&self) {
        self.shared.cancel_duplication();
    }

    pub fn is_duplication_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Cooperative interrupt visible through `TaskContext::is_interrupted`.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    pub fn counts(&self) -> InvocationCounts {
        self.shared.counter.snapshot()
    }
}

impl<R> std::fmt::Debug for InnerTaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerTaskHandle")
            .field("name", &self.shared.name)
            .field("counts", &self.counts())
            .finish()
    }
}
