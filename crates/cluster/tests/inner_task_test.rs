//! Inner tasks fanned out over the local environment and clusters.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kiln_cluster::{
    ClusterCoordinator, ClusterError, ClusterTaskInvoker, DuplicationMode, InnerTaskParameters,
    TaskInvoker,
};
use kiln_compute::TokenAllocator;
use kiln_core::{
    Capability, EnvironmentId, EnvironmentSelection, ExecutionEnvironment, FnTaskFactory,
    SelectionResult, TaskError, TaskFactory,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const TOKENS_PER_ENVIRONMENT: usize = 2;

fn coordinator(role: &str) -> ClusterCoordinator {
    ClusterCoordinator::with_allocator(
        ExecutionEnvironment::new().with_property("role", role),
        Arc::new(TokenAllocator::new(TOKENS_PER_ENVIRONMENT)),
    )
}

fn add_cluster(coordinator: &ClusterCoordinator, role: &str) -> Arc<ClusterTaskInvoker> {
    let invoker = Arc::new(ClusterTaskInvoker::with_allocator(
        ExecutionEnvironment::new().with_property("role", role),
        Arc::new(TokenAllocator::new(TOKENS_PER_ENVIRONMENT)),
    ));
    coordinator
        .connect(invoker.environment_id(), Arc::clone(&invoker) as Arc<dyn TaskInvoker>)
        .unwrap();
    invoker
}

fn anywhere(selected: EnvironmentId) -> SelectionResult {
    SelectionResult::new(selected, EnvironmentSelection::default())
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Reports the environment it ran in; counts every start.
fn located(started: &Arc<AtomicUsize>) -> Arc<dyn TaskFactory<EnvironmentId>> {
    let started = Arc::clone(started);
    Arc::new(
        FnTaskFactory::new("located", move |ctx| {
            started.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            Ok(ctx.environment_id())
        })
        .with_capability(Capability::RemoteDispatchable)
        .with_capability(Capability::ComputationalInnerTasks)
        .with_token_count(1),
    )
}

fn always() -> DuplicationMode {
    DuplicationMode::coordinated(|| Ok::<_, TaskError>(true))
}

#[test]
fn unlimited_fan_out_stops_soon_after_cancel() {
    let coordinator = coordinator("coordinator");
    add_cluster(&coordinator, "worker");
    add_cluster(&coordinator, "worker");
    let started = Arc::new(AtomicUsize::new(0));

    let results = coordinator
        .invoke_inner_task(
            located(&started),
            &anywhere(coordinator.local_environment().id()),
            InnerTaskParameters::new()
                .with_cluster_duplicate_factor(-1)
                .with_duplication(always()),
        )
        .unwrap();

    assert!(wait_until(|| results.contributor_count() == 3));
    assert!(wait_until(|| started.load(Ordering::SeqCst) >= 10));
    assert!(results.cancel_duplication());
    let at_cancel = started.load(Ordering::SeqCst);

    let collected = results.collect().unwrap();
    results.wait_finish();
    let total = started.load(Ordering::SeqCst);
    // Each environment may finish what was running plus one start that raced
    // with the cancel in every worker.
    let bound = 3 * TOKENS_PER_ENVIRONMENT * 2;
    assert!(total <= at_cancel + bound, "{total} started, {at_cancel} at cancel");
    assert_eq!(collected.len(), total);
    assert!(collected.iter().all(|r| !r.is_failed()));
}

#[test]
fn duplicate_factor_caps_contributing_environments() {
    let coordinator = coordinator("coordinator");
    for _ in 0..3 {
        add_cluster(&coordinator, "worker");
    }
    let started = Arc::new(AtomicUsize::new(0));

    let results = coordinator
        .invoke_inner_task(
            located(&started),
            &anywhere(coordinator.local_environment().id()),
            InnerTaskParameters::new().with_cluster_duplicate_factor(2),
        )
        .unwrap();

    let collected = results.collect().unwrap();
    assert_eq!(collected.len(), 2);
    assert_eq!(results.contributor_count(), 2);
    assert!(results
        .contributors()
        .contains(&coordinator.local_environment().id()));
}

#[test]
fn without_fan_out_only_the_selected_cluster_runs() {
    let coordinator = coordinator("worker");
    add_cluster(&coordinator, "worker");
    let chosen = add_cluster(&coordinator, "worker");
    let started = Arc::new(AtomicUsize::new(0));

    let results = coordinator
        .invoke_inner_task(
            located(&started),
            &anywhere(chosen.environment_id()),
            InnerTaskParameters::new(),
        )
        .unwrap();

    let environments: Vec<_> = results
        .collect()
        .unwrap()
        .into_iter()
        .map(|r| r.into_result().unwrap())
        .collect();
    assert_eq!(environments, [chosen.environment_id()]);
}

#[test]
fn allow_list_restricts_fan_out() {
    let coordinator = coordinator("worker");
    let allowed = add_cluster(&coordinator, "worker");
    add_cluster(&coordinator, "worker");
    let started = Arc::new(AtomicUsize::new(0));

    let results = coordinator
        .invoke_inner_task(
            located(&started),
            &anywhere(coordinator.local_environment().id()),
            InnerTaskParameters::new()
                .with_cluster_duplicate_factor(-1)
                .with_allowed_environments([allowed.environment_id()]),
        )
        .unwrap();

    let environments: BTreeSet<_> = results
        .collect()
        .unwrap()
        .into_iter()
        .map(|r| r.into_result().unwrap())
        .collect();
    assert_eq!(environments, [allowed.environment_id()].into());
}

#[test]
fn initialization_error_when_no_environment_qualifies() {
    let coordinator = coordinator("coordinator");
    add_cluster(&coordinator, "storage");
    add_cluster(&coordinator, "storage");
    let started = Arc::new(AtomicUsize::new(0));
    let selection = SelectionResult::new(
        coordinator.local_environment().id(),
        EnvironmentSelection::default().qualified_by("role", "worker"),
    );

    let results = coordinator
        .invoke_inner_task(
            located(&started),
            &selection,
            InnerTaskParameters::new().with_cluster_duplicate_factor(-1),
        )
        .unwrap();

    match results.next() {
        Err(ClusterError::InnerTaskInitialization { causes }) => {
            assert_eq!(causes.len(), 3);
            assert!(causes
                .iter()
                .all(|c| matches!(c, ClusterError::Unsuitable { .. })));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(results.next().unwrap().is_none());
    assert_eq!(started.load(Ordering::SeqCst), 0);
}

#[test]
fn disconnect_fails_only_that_contributor() {
    let coordinator = coordinator("worker");
    let doomed = add_cluster(&coordinator, "worker");
    let healthy = add_cluster(&coordinator, "worker");
    let doomed_id = doomed.environment_id();

    let factory: Arc<dyn TaskFactory<EnvironmentId>> = Arc::new(
        FnTaskFactory::new("stuck-on-one", move |ctx| {
            if ctx.environment_id() == doomed_id {
                while !ctx.is_interrupted() {
                    thread::sleep(Duration::from_millis(1));
                }
                return Err(TaskError::Interrupted);
            }
            Ok(ctx.environment_id())
        })
        .with_capability(Capability::RemoteDispatchable),
    );
    let results = coordinator
        .invoke_inner_task(
            factory,
            &anywhere(coordinator.local_environment().id()),
            InnerTaskParameters::new().with_cluster_duplicate_factor(-1),
        )
        .unwrap();

    assert!(wait_until(|| results.contributor_count() == 3));
    doomed.disconnect("power loss");

    let mut succeeded = BTreeSet::new();
    let mut failures = Vec::new();
    for result in results.collect().unwrap() {
        match result.into_result() {
            Ok(environment) => {
                succeeded.insert(environment);
            }
            Err(e) => failures.push(e),
        }
    }
    assert_eq!(
        succeeded,
        [coordinator.local_environment().id(), healthy.environment_id()].into()
    );
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        TaskError::Remote {
            environment,
            message,
        } => {
            assert_eq!(*environment, doomed_id.to_string());
            assert!(message.contains("power loss"));
        }
        other => panic!("unexpected failure: {other}"),
    }
}
