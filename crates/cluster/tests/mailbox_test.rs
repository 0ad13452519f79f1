//! Mailbox lifecycle as driven by the coordinator: queued events, disconnects
//! and invokers that stop on their own.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_cluster::{ClusterCoordinator, ClusterError, Mailbox, TaskInvoker};
use kiln_compute::TokenAllocator;
use kiln_core::{
    Capability, EnvironmentId, ExecutionEnvironment, FnTaskFactory, PropertySelector,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Does not look at its mailbox until released, so events pile up.
struct GatedInvoker {
    gate: Mutex<Receiver<()>>,
}

impl TaskInvoker for GatedInvoker {
    fn run(&self, mailbox: &Mailbox) -> Result<(), ClusterError> {
        let _ = self.gate.lock().unwrap().recv();
        while let Some(batch) = mailbox.poll() {
            for event in batch {
                event.dismiss();
            }
        }
        Ok(())
    }
}

/// Fails right away, like a link that never came up.
struct BrokenInvoker;

impl TaskInvoker for BrokenInvoker {
    fn run(&self, mailbox: &Mailbox) -> Result<(), ClusterError> {
        Err(ClusterError::Disconnected {
            environment: mailbox.environment_id(),
            reason: "handshake refused".into(),
        })
    }
}

fn coordinator() -> ClusterCoordinator {
    ClusterCoordinator::with_allocator(
        ExecutionEnvironment::new().with_property("role", "coordinator"),
        Arc::new(TokenAllocator::new(2)),
    )
}

fn remote_worker_task() -> FnTaskFactory<u32> {
    FnTaskFactory::new("remote-only", |_| Ok(1))
        .with_capability(Capability::RemoteDispatchable)
        .with_selector(Arc::new(PropertySelector::new("role", "worker")))
}

#[test]
fn disconnect_fails_queued_events() {
    let coordinator = coordinator();
    let (release, gate) = mpsc::channel();
    let cluster = EnvironmentId::new();
    let mailbox = coordinator
        .connect(
            cluster,
            Arc::new(GatedInvoker {
                gate: Mutex::new(gate),
            }),
        )
        .unwrap();

    let first = coordinator.select_environment(&remote_worker_task(), None);
    let second = coordinator.select_environment(&remote_worker_task(), None);
    assert_eq!(mailbox.pending_count(), 2);
    assert!(!first.is_done());

    assert!(coordinator.disconnect(cluster, "maintenance"));
    for future in [first, second] {
        match future.wait_timeout(TIMEOUT).expect("selection never resolved") {
            Err(ClusterError::EnvironmentSelectionFailed { remote, .. }) => {
                assert_eq!(remote.len(), 1);
                assert!(remote[0].to_string().contains("maintenance"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(mailbox.pending_count(), 0);
    assert!(coordinator.cluster_ids().is_empty());
    assert!(!coordinator.disconnect(cluster, "again"));

    release.send(()).unwrap();
    coordinator.close();
}

#[test]
fn failing_invoker_closes_its_mailbox() {
    let coordinator = coordinator();
    let cluster = EnvironmentId::new();
    let mailbox = coordinator.connect(cluster, Arc::new(BrokenInvoker)).unwrap();

    let deadline = std::time::Instant::now() + TIMEOUT;
    while !mailbox.is_closed() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(mailbox.is_closed());

    // Later selections skip the closed mailbox entirely.
    let err = coordinator
        .select_environment(&remote_worker_task(), None)
        .wait()
        .unwrap_err();
    assert!(matches!(
        err,
        ClusterError::EnvironmentSelectionFailed { ref remote, .. } if remote.is_empty()
    ));

    // The environment can connect again once its old mailbox closed.
    let (release, gate) = mpsc::channel();
    assert!(coordinator
        .connect(
            cluster,
            Arc::new(GatedInvoker {
                gate: Mutex::new(gate),
            }),
        )
        .is_ok());
    assert_eq!(coordinator.cluster_ids(), [cluster]);
    drop(release);
}

#[test]
fn connecting_twice_is_rejected() {
    let coordinator = coordinator();
    let cluster = EnvironmentId::new();
    let (release, gate) = mpsc::channel();
    coordinator
        .connect(
            cluster,
            Arc::new(GatedInvoker {
                gate: Mutex::new(gate),
            }),
        )
        .unwrap();
    assert!(coordinator.connect(cluster, Arc::new(BrokenInvoker)).is_err());
    release.send(()).unwrap();
}

#[test]
fn closed_coordinator_refuses_new_work() {
    let coordinator = coordinator();
    coordinator.close();
    assert!(coordinator
        .connect(EnvironmentId::new(), Arc::new(BrokenInvoker))
        .is_err());
}
