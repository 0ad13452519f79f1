use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use kiln_core::sync::lock;
use kiln_core::{EnvironmentId, TaskContext, TaskError, TaskFactory};
use tracing::{debug, info, warn};

use super::execution::Duplication;
use super::handle::{InnerTaskHandle, InnerTaskListener, InvocationShared, NoopListener};
use super::pool::WorkPool;
use crate::duplication::DuplicationPredicate;
use crate::token::{AllocatorKey, TokenAllocator};

/// Everything needed to start one inner task.
pub struct InnerTaskRequest<R> {
    pub factory: Arc<dyn TaskFactory<R>>,
    pub key: AllocatorKey,
    pub predicate: Option<Arc<dyn DuplicationPredicate>>,
    /// Ceiling on concurrent invocations in this environment; <= 0 is unlimited.
    pub max_environment_factor: i32,
    pub listener: Arc<dyn InnerTaskListener>,
    /// Invoked on behalf of another environment.
    pub remote: bool,
}

impl<R> InnerTaskRequest<R> {
    pub fn new(factory: Arc<dyn TaskFactory<R>>) -> Self {
        Self {
            factory,
            key: AllocatorKey::new(),
            predicate: None,
            max_environment_factor: 0,
            listener: Arc::new(NoopListener),
            remote: false,
        }
    }

    pub fn with_key(mut self, key: AllocatorKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn DuplicationPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_max_environment_factor(mut self, factor: i32) -> Self {
        self.max_environment_factor = factor;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn InnerTaskListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }
}

/// Interrupt access to a running invocation without knowing its result type.
trait InvocationControl: Send + Sync {
    fn interrupt(&self);
    fn name(&self) -> &str;
}

impl<R: Send> InvocationControl for InvocationShared<R> {
    fn interrupt(&self) {
        InvocationShared::interrupt(self);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Registered {
    control: Arc<dyn InvocationControl>,
    thread: Option<JoinHandle<()>>,
}

type Registry = Arc<Mutex<HashMap<u64, Registered>>>;

/// Starts inner tasks in one execution environment and tracks their driver
/// threads until they complete, so shutdown can interrupt and join stragglers.
pub struct InnerTaskManager {
    allocator: Arc<TokenAllocator>,
    environment_id: EnvironmentId,
    registry: Registry,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InnerTaskManager {
    pub fn new(allocator: Arc<TokenAllocator>, environment_id: EnvironmentId) -> Self {
        Self {
            allocator,
            environment_id,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn allocator(&self) -> &Arc<TokenAllocator> {
        &self.allocator
    }

    pub fn environment_id(&self) -> EnvironmentId {
        self.environment_id
    }

    /// Number of invocations whose driver has not completed yet.
    pub fn running_invocations(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Start an inner task. The first predicate evaluation happens on the
    /// calling thread: its error is returned, and a `false` answer yields a
    /// handle that is already finished without invocations.
    pub fn invoke_inner_task<R: Send + 'static>(
        &self,
        request: InnerTaskRequest<R>,
    ) -> Result<InnerTaskHandle<R>, TaskError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskError::Interrupted);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = request.factory.name().to_string();
        let shared = Arc::new(InvocationShared::new(
            id,
            name.clone(),
            Arc::clone(&self.allocator),
            Arc::clone(&request.listener),
        ));
        let handle = InnerTaskHandle {
            shared: Arc::clone(&shared),
        };

        if let Some(predicate) = &request.predicate {
            if !predicate.should_invoke_once_more()? {
                debug!(task = %name, "duplication predicate declined the first invocation");
                shared.finish();
                return Ok(handle);
            }
        }

        let token_count = request.factory.requested_computation_token_count();
        let worker_cap = WorkPool::worker_cap(
            token_count,
            self.allocator.max_tokens(),
            request.max_environment_factor,
        );
        let context = TaskContext::new(
            self.environment_id,
            request.remote,
            Arc::clone(&shared.interrupted),
        );
        let duplication = Duplication::new(
            Arc::clone(&shared),
            request.factory,
            request.key,
            request.predicate,
            worker_cap,
            context,
        );

        lock(&self.registry).insert(
            id,
            Registered {
                control: Arc::clone(&shared) as Arc<dyn InvocationControl>,
                thread: None,
            },
        );
        let registry = Arc::clone(&self.registry);
        let spawned = thread::Builder::new()
            .name(format!("inner-task-{name}"))
            .spawn(move || {
                duplication.drive();
                lock(&registry).remove(&id);
            });

        match spawned {
            Ok(thread) => {
                if let Some(entry) = lock(&self.registry).get_mut(&id) {
                    entry.thread = Some(thread);
                }
                debug!(task = %name, id, "inner task started");
                Ok(handle)
            }
            Err(e) => {
                lock(&self.registry).remove(&id);
                Err(TaskError::failed(format!(
                    "failed to start inner task thread for {name}: {e}"
                )))
            }
        }
    }

    /// Refuse new invocations, interrupt running ones and join their drivers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<Registered> = lock(&self.registry).drain().map(|(_, e)| e).collect();
        if !entries.is_empty() {
            info!("Interrupting {} running inner tasks", entries.len());
        }
        for entry in &entries {
            entry.control.interrupt();
        }
        for entry in entries {
            if let Some(thread) = entry.thread {
                if thread.join().is_err() {
                    warn!("Inner task driver for {} panicked", entry.control.name());
                }
            }
        }
    }
}

impl Drop for InnerTaskManager {
    fn drop(&mut self) {
        self.close();
    }
}
