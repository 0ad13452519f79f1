use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kiln_core::{EnvironmentId, FnTaskFactory, Task, TaskContext, TaskError, TaskFactory};

use super::*;
use crate::duplication::{DuplicationPredicate, FixedCountPredicate, SerializedPredicate};
use crate::token::TokenAllocator;

const TIMEOUT: Duration = Duration::from_secs(10);

fn manager(max_tokens: usize) -> InnerTaskManager {
    InnerTaskManager::new(Arc::new(TokenAllocator::new(max_tokens)), EnvironmentId::new())
}

/// Answers from a fixed script, then `false` forever.
struct ScriptedPredicate {
    answers: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl ScriptedPredicate {
    fn new(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl DuplicationPredicate for ScriptedPredicate {
    fn should_invoke_once_more(&self) -> Result<bool, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or(false))
    }
}

fn always() -> Arc<dyn DuplicationPredicate> {
    Arc::new(|| Ok::<_, TaskError>(true))
}

/// Counts invocations and tracks peak concurrency.
fn counting_factory(
    name: &str,
    tokens: usize,
    work: Duration,
) -> (Arc<FnTaskFactory<usize>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let started = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let factory = {
        let started = Arc::clone(&started);
        let peak = Arc::clone(&peak);
        FnTaskFactory::new(name, move |_ctx: &TaskContext| {
            let n = started.fetch_add(1, Ordering::SeqCst);
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(work);
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(n)
        })
        .with_token_count(tokens)
    };
    (Arc::new(factory), started, peak)
}

#[derive(Default)]
struct RecordingListener {
    starts: AtomicUsize,
    ready: AtomicUsize,
    finished: Mutex<Option<InvocationCounts>>,
    refuse: AtomicBool,
}

impl InnerTaskListener for RecordingListener {
    fn notify_invocation_start(&self) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn notify_result_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_finished(&self, counts: InvocationCounts) {
        *self.finished.lock().unwrap() = Some(counts);
    }
}

#[test]
fn single_invocation_without_predicate() {
    let mgr = manager(2);
    let factory = Arc::new(FnTaskFactory::new("answer", |_: &TaskContext| Ok(42)).with_token_count(1));
    let listener = Arc::new(RecordingListener::default());

    let handle = mgr
        .invoke_inner_task(InnerTaskRequest::new(factory).with_listener(listener.clone()))
        .unwrap();
    let counts = handle.wait_finish();

    assert_eq!(counts.invoked, 1);
    assert_eq!(counts.results, 1);
    assert!(counts.last_result_sent);
    assert_eq!(handle.take_result(), Some(InnerTaskResult::Completed(42)));
    assert_eq!(handle.take_result(), None);
    assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
    assert_eq!(listener.ready.load(Ordering::SeqCst), 1);
    assert_eq!(*listener.finished.lock().unwrap(), Some(counts));
    assert_eq!(mgr.allocator().allocated_total(), 0);
}

#[test]
fn true_true_false_runs_exactly_two_invocations() {
    let mgr = manager(4);
    let (factory, started, _) = counting_factory("scripted", 1, Duration::from_millis(5));
    let predicate = Arc::new(ScriptedPredicate::new(&[true, true, false]));
    let shared = {
        let predicate = Arc::clone(&predicate);
        Arc::new(SerializedPredicate::new(move || predicate.should_invoke_once_more()))
    };

    let handle = mgr
        .invoke_inner_task(InnerTaskRequest::new(factory).with_predicate(shared.clone()))
        .unwrap();
    let counts = handle.wait_finish();

    assert_eq!(counts.invoked, 2);
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(handle.drain_results().len(), 2);
    // Latched: asking again after the first false stays false.
    assert!(!shared.should_invoke_once_more().unwrap());
    assert_eq!(predicate.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn declined_first_evaluation_yields_finished_handle() {
    let mgr = manager(2);
    let (factory, started, _) = counting_factory("never", 1, Duration::ZERO);
    let listener = Arc::new(RecordingListener::default());

    let handle = mgr
        .invoke_inner_task(
            InnerTaskRequest::new(factory)
                .with_predicate(Arc::new(FixedCountPredicate::new(0)))
                .with_listener(listener.clone()),
        )
        .unwrap();

    assert!(handle.is_finished());
    assert_eq!(handle.counts().invoked, 0);
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert!(listener.finished.lock().unwrap().unwrap().last_result_sent);
}

#[test]
fn failing_first_evaluation_is_returned_to_the_caller() {
    let mgr = manager(2);
    let (factory, _, _) = counting_factory("broken-predicate", 1, Duration::ZERO);
    let predicate = || Err::<bool, _>(TaskError::failed("no more input"));

    let err = mgr
        .invoke_inner_task(InnerTaskRequest::new(factory).with_predicate(Arc::new(predicate)))
        .unwrap_err();
    assert_eq!(err, TaskError::failed("no more input"));
}

#[test]
fn token_free_tasks_duplicate_on_the_fixed_pool() {
    let mgr = manager(2);
    let (factory, started, peak) = counting_factory("no-tokens", 0, Duration::from_millis(2));

    let handle = mgr
        .invoke_inner_task(
            InnerTaskRequest::new(factory).with_predicate(Arc::new(FixedCountPredicate::new(20))),
        )
        .unwrap();
    let counts = handle.wait_finish();

    assert_eq!(counts.invoked, 20);
    assert_eq!(started.load(Ordering::SeqCst), 20);
    // Fixed pool of max * 3 / 2 threads.
    assert!(peak.load(Ordering::SeqCst) <= 3);
}

#[test]
fn environment_factor_caps_concurrency() {
    let mgr = manager(8);
    let (factory, started, peak) = counting_factory("capped", 1, Duration::from_millis(5));

    let handle = mgr
        .invoke_inner_task(
            InnerTaskRequest::new(factory)
                .with_predicate(Arc::new(FixedCountPredicate::new(6)))
                .with_max_environment_factor(2),
        )
        .unwrap();
    handle.wait_finish();

    assert_eq!(started.load(Ordering::SeqCst), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn duplicates_are_bounded_by_free_tokens() {
    let mgr = manager(2);
    let (factory, started, peak) = counting_factory("throttled", 1, Duration::from_millis(5));

    let handle = mgr
        .invoke_inner_task(
            InnerTaskRequest::new(factory).with_predicate(Arc::new(FixedCountPredicate::new(10))),
        )
        .unwrap();
    handle.wait_finish();

    assert_eq!(started.load(Ordering::SeqCst), 10);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(mgr.allocator().allocated_total(), 0);
}

#[test]
fn failures_are_delivered_as_results() {
    struct Flaky {
        calls: AtomicUsize,
    }

    impl TaskFactory<u32> for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn create_task(&self) -> Result<Option<Box<dyn Task<u32>>>, TaskError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(TaskError::failed("factory broke")),
                1 => Ok(None),
                2 => Ok(Some(Box::new(|_: &TaskContext| -> Result<u32, TaskError> {
                    panic!("task body exploded")
                }))),
                _ => Ok(Some(Box::new(|_: &TaskContext| -> Result<u32, TaskError> { Ok(7) }))),
            }
        }
    }

    let mgr = manager(2);
    let factory = Arc::new(Flaky {
        calls: AtomicUsize::new(0),
    });
    let handle = mgr
        .invoke_inner_task(
            InnerTaskRequest::new(factory).with_predicate(Arc::new(FixedCountPredicate::new(4))),
        )
        .unwrap();
    let counts = handle.wait_finish();
    assert_eq!(counts.invoked, 4);
    assert_eq!(counts.results, 4);

    let results = handle.drain_results();
    let failures: Vec<_> = results
        .iter()
        .filter_map(|r| match r {
            InnerTaskResult::Failed(e) => Some(e.clone()),
            InnerTaskResult::Completed(_) => None,
        })
        .collect();
    assert_eq!(failures.len(), 3);
    assert!(failures.contains(&TaskError::failed("factory broke")));
    assert!(failures.contains(&TaskError::NoTask("flaky".into())));
    assert!(failures.contains(&TaskError::Panicked("task body exploded".into())));
    assert!(results.contains(&InnerTaskResult::Completed(7)));
}

#[test]
fn cancel_duplication_lets_running_invocations_finish() {
    let mgr = manager(2);
    let (factory, started, _) = counting_factory("endless", 1, Duration::from_millis(5));

    let handle = mgr
        .invoke_inner_task(InnerTaskRequest::new(factory).with_predicate(always()))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    handle.cancel_duplication();
    let at_cancel = started.load(Ordering::SeqCst);

    let counts = handle.wait_finish();
    assert!(handle.is_duplication_cancelled());
    assert_eq!(counts.results, counts.invoked);
    // Each of at most 2 workers may have passed its stop check already.
    assert!(started.load(Ordering::SeqCst) <= at_cancel + 2);
    assert!(handle.drain_results().iter().all(|r| !r.is_failed()));
}

#[test]
fn cancel_wakes_a_driver_waiting_for_tokens() {
    let allocator = Arc::new(TokenAllocator::new(1));
    let mgr = InnerTaskManager::new(Arc::clone(&allocator), EnvironmentId::new());
    // Someone else holds the whole pool, so the core token never comes.
    let blocker = allocator.request(&crate::AllocatorKey::new(), 1);
    let (factory, started, _) = counting_factory("starved", 1, Duration::ZERO);

    let handle = mgr.invoke_inner_task(InnerTaskRequest::new(factory)).unwrap();
    thread::sleep(Duration::from_millis(50));
    handle.cancel_duplication();

    let deadline = Instant::now() + TIMEOUT;
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "driver still waiting for a token");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(started.load(Ordering::SeqCst), 0);
    drop(blocker);
}

#[test]
fn interrupt_reaches_running_tasks() {
    let mgr = manager(2);
    let factory = Arc::new(FnTaskFactory::new("spinner", |ctx: &TaskContext| {
        while !ctx.is_interrupted() {
            thread::sleep(Duration::from_millis(1));
        }
        ctx.check_interrupted().map(|_| 0u8)
    }));

    let handle = mgr.invoke_inner_task(InnerTaskRequest::new(factory)).unwrap();
    thread::sleep(Duration::from_millis(20));
    handle.interrupt();
    handle.wait_finish();

    assert_eq!(handle.take_result(), Some(InnerTaskResult::Failed(TaskError::Interrupted)));
}

#[test]
fn refused_invocations_never_run() {
    let mgr = manager(2);
    let (factory, started, _) = counting_factory("refused", 1, Duration::ZERO);
    let listener = Arc::new(RecordingListener::default());
    listener.refuse.store(true, Ordering::SeqCst);

    let handle = mgr
        .invoke_inner_task(
            InnerTaskRequest::new(factory)
                .with_predicate(always())
                .with_listener(listener.clone()),
        )
        .unwrap();
    let counts = handle.wait_finish();

    assert_eq!(counts.invoked, 0);
    assert_eq!(started.load(Ordering::SeqCst), 0);
}

#[test]
fn close_interrupts_and_joins_running_drivers() {
    let mgr = manager(2);
    let factory = Arc::new(FnTaskFactory::new("until-interrupted", |ctx: &TaskContext| {
        while !ctx.is_interrupted() {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }));
    let handle = mgr.invoke_inner_task(InnerTaskRequest::new(factory)).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(mgr.running_invocations(), 1);

    mgr.close();
    assert!(handle.is_finished());
    assert_eq!(mgr.running_invocations(), 0);

    let (factory, _, _) = counting_factory("late", 0, Duration::ZERO);
    assert_eq!(
        mgr.invoke_inner_task(InnerTaskRequest::new(factory)).unwrap_err(),
        TaskError::Interrupted
    );
}
