//! Driver and worker loops of one inner task invocation.
//!
//! The driver thread acquires the core token, then either runs a single
//! invocation or starts a work pool: the core worker runs on the pool while
//! the driver keeps spawning duplicates for as long as the predicate, the
//! token supply and the worker ceiling allow.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use kiln_core::{TaskContext, TaskError, TaskFactory};
use tracing::{debug, warn};

use super::handle::{InnerTaskResult, InvocationShared};
use super::pool::WorkPool;
use crate::duplication::DuplicationPredicate;
use crate::token::{AllocatorKey, ComputationToken};

/// Create a task from `factory` and run it once. Panics, factory errors and
/// factories producing no task all come back as `Err`.
pub fn run_task<R>(factory: &dyn TaskFactory<R>, ctx: &TaskContext) -> Result<R, TaskError> {
    catch_unwind(AssertUnwindSafe(|| {
        let mut task = factory
            .create_task()?
            .ok_or_else(|| TaskError::NoTask(factory.name().to_string()))?;
        task.run(ctx)
    }))
    .unwrap_or_else(|payload| Err(TaskError::from_panic(payload.as_ref())))
}

pub(crate) struct Duplication<R> {
    shared: Arc<InvocationShared<R>>,
    factory: Arc<dyn TaskFactory<R>>,
    key: AllocatorKey,
    token_count: usize,
    predicate: Option<Arc<dyn DuplicationPredicate>>,
    worker_cap: Option<usize>,
    context: TaskContext,
    /// The predicate answered false (or failed); nothing new may start.
    exhausted: AtomicBool,
}

impl<R: Send + 'static> Duplication<R> {
    pub(crate) fn new(
        shared: Arc<InvocationShared<R>>,
        factory: Arc<dyn TaskFactory<R>>,
        key: AllocatorKey,
        predicate: Option<Arc<dyn DuplicationPredicate>>,
        worker_cap: Option<usize>,
        context: TaskContext,
    ) -> Self {
        let token_count = factory.requested_computation_token_count();
        Self {
            shared,
            factory,
            key,
            token_count,
            predicate,
            worker_cap,
            context,
            exhausted: AtomicBool::new(false),
        }
    }

    pub(crate) fn drive(&self) {
        let core_token = self.shared.allocator.request_abortable(
            &self.key,
            self.token_count,
            &|| self.shared.should_stop(),
        );
        match core_token {
            None => debug!(
                task = %self.shared.name,
                id = self.shared.id,
                "inner task stopped before its core invocation"
            ),
            Some(token) => {
                if self.predicate.is_some() {
                    self.run_duplicated();
                } else {
                    self.invoke_once();
                }
                token.close();
            }
        }
        let counts = self.shared.finish();
        debug!(
            task = %self.shared.name,
            id = self.shared.id,
            invoked = counts.invoked,
            results = counts.results,
            "inner task finished"
        );
    }

    fn run_duplicated(&self) {
        let max_tokens = self.shared.allocator.max_tokens();
        match WorkPool::for_task(&self.shared.name, self.token_count, max_tokens) {
            WorkPool::Fixed(pool) => pool.in_place_scope(|scope| {
                scope.spawn(|_| self.work(None));
                self.duplicate(|token| {
                    scope.spawn(move |_| self.work(Some(token)));
                    true
                });
            }),
            WorkPool::Dynamic => thread::scope(|scope| {
                let core = thread::Builder::new()
                    .name(format!("{}-core", self.shared.name))
                    .spawn_scoped(scope, || self.work(None));
                if let Err(e) = core {
                    self.shared
                        .post_failure(TaskError::failed(format!("failed to start worker: {e}")));
                    return;
                }
                let mut spawned = 0usize;
                self.duplicate(|token| {
                    spawned += 1;
                    let name = format!("{}-dup-{}", self.shared.name, spawned);
                    match thread::Builder::new()
                        .name(name)
                        .spawn_scoped(scope, move || self.work(Some(token)))
                    {
                        Ok(_) => true,
                        Err(e) => {
                            warn!("Failed to start duplicate of {}: {}", self.shared.name, e);
                            false
                        }
                    }
                });
            }),
        }
    }

    /// Keeps adding workers; `spawn` returns false if the worker could not start.
    fn duplicate(&self, mut spawn: impl FnMut(ComputationToken) -> bool) {
        let mut workers = 1usize;
        loop {
            if self.should_stop() {
                break;
            }
            if self.worker_cap.is_some_and(|cap| workers >= cap) {
                debug!(task = %self.shared.name, workers, "duplicate ceiling reached");
                break;
            }
            let Some(token) = self.shared.allocator.request_additional_abortable(
                &self.key,
                self.token_count,
                &|| self.should_stop(),
            ) else {
                break;
            };
            if !self.evaluate_predicate() {
                break;
            }
            if !spawn(token) {
                break;
            }
            workers += 1;
        }
    }

    /// `token` is `None` for the core worker, whose token the driver holds.
    ///
    /// Every pass through the loop was approved by a predicate answer, so only
    /// cancellation or interruption may skip it; a later `false` seen by
    /// another worker does not.
    fn work(&self, token: Option<ComputationToken>) {
        let releasable = token.is_some() && self.token_count > 0;
        let mut token = token;
        loop {
            if self.shared.should_stop() {
                break;
            }
            if !self.invoke_once() {
                self.exhaust();
                break;
            }
            if releasable && token.as_ref().is_some_and(|t| t.release_if_over_allocated()) {
                token = self.shared.allocator.request_additional_abortable(
                    &self.key,
                    self.token_count,
                    &|| self.should_stop(),
                );
                if token.is_none() {
                    break;
                }
            }
            if !self.evaluate_predicate() {
                break;
            }
        }
    }

    /// Returns false if no invocation could be begun.
    fn invoke_once(&self) -> bool {
        if !self.shared.begin() {
            return false;
        }
        let result = run_task(self.factory.as_ref(), &self.context);
        if let Err(e) = &result {
            debug!(task = %self.shared.name, id = self.shared.id, error = %e, "inner task invocation failed");
        }
        self.shared.post(InnerTaskResult::from(result));
        true
    }

    fn evaluate_predicate(&self) -> bool {
        let Some(predicate) = &self.predicate else {
            return false;
        };
        if self.exhausted.load(Ordering::Acquire) {
            return false;
        }
        match predicate.should_invoke_once_more() {
            Ok(true) => true,
            Ok(false) => {
                self.exhaust();
                false
            }
            Err(e) => {
                self.exhaust();
                self.shared.post_failure(e);
                false
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.shared.should_stop() || self.exhausted.load(Ordering::Acquire)
    }

    fn exhaust(&self) {
        if !self.exhausted.swap(true, Ordering::AcqRel) {
            self.shared.allocator.wake_up_waiters();
        }
    }
}
