use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::environment::{AnyEnvironmentSelector, EnvironmentId, SharedSelector};
use crate::error::TaskError;

// ── Capabilities ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ShortTask,
    RemoteDispatchable,
    Cacheable,
    ComputationalInnerTasks,
    PrefersLocalEnvironment,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTask => "short-task",
            Self::RemoteDispatchable => "remote-dispatchable",
            Self::Cacheable => "cacheable",
            Self::ComputationalInnerTasks => "computational-inner-tasks",
            Self::PrefersLocalEnvironment => "prefers-local-environment",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short-task" => Ok(Self::ShortTask),
            "remote-dispatchable" => Ok(Self::RemoteDispatchable),
            "cacheable" => Ok(Self::Cacheable),
            "computational-inner-tasks" => Ok(Self::ComputationalInnerTasks),
            "prefers-local-environment" => Ok(Self::PrefersLocalEnvironment),
            other => Err(format!("unknown task capability: {other}")),
        }
    }
}

// ── Task context ──────────────────────────────────────────

/// Per-invocation context handed to a running task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    environment_id: EnvironmentId,
    remote: bool,
    interrupted: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(environment_id: EnvironmentId, remote: bool, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            environment_id,
            remote,
            interrupted,
        }
    }

    pub fn local(environment_id: EnvironmentId) -> Self {
        Self::new(environment_id, false, Arc::new(AtomicBool::new(false)))
    }

    pub fn environment_id(&self) -> EnvironmentId {
        self.environment_id
    }

    /// Whether the task runs on behalf of another environment.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// `Err(Interrupted)` once the owning invocation was interrupted.
    pub fn check_interrupted(&self) -> Result<(), TaskError> {
        if self.is_interrupted() {
            Err(TaskError::Interrupted)
        } else {
            Ok(())
        }
    }
}

// ── Task and factory ──────────────────────────────────────────

pub trait Task<R>: Send {
    fn run(&mut self, ctx: &TaskContext) -> Result<R, TaskError>;
}

impl<R, F> Task<R> for F
where
    F: FnMut(&TaskContext) -> Result<R, TaskError> + Send,
{
    fn run(&mut self, ctx: &TaskContext) -> Result<R, TaskError> {
        self(ctx)
    }
}

/// Produces task instances and describes how they may be scheduled.
pub trait TaskFactory<R>: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` is reported as [`TaskError::NoTask`] by the executor.
    fn create_task(&self) -> Result<Option<Box<dyn Task<R>>>, TaskError>;

    /// Tokens held for each invocation; 0 disables throttling.
    fn requested_computation_token_count(&self) -> usize {
        0
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        BTreeSet::new()
    }

    fn environment_selector(&self) -> SharedSelector {
        Arc::new(AnyEnvironmentSelector)
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

type TaskBody<R> = dyn Fn(&TaskContext) -> Result<R, TaskError> + Send + Sync;

/// Factory backed by a closure; every created task calls the same body.
pub struct FnTaskFactory<R> {
    name: String,
    token_count: usize,
    capabilities: BTreeSet<Capability>,
    selector: SharedSelector,
    body: Arc<TaskBody<R>>,
}

impl<R: Send + 'static> FnTaskFactory<R> {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TaskContext) -> Result<R, TaskError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            token_count: 0,
            capabilities: BTreeSet::new(),
            selector: Arc::new(AnyEnvironmentSelector),
            body: Arc::new(body),
        }
    }

    pub fn with_token_count(mut self, count: usize) -> Self {
        self.token_count = count;
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_selector(mut self, selector: SharedSelector) -> Self {
        self.selector = selector;
        self
    }
}

struct FnTask<R> {
    body: Arc<TaskBody<R>>,
}

impl<R: Send> Task<R> for FnTask<R> {
    fn run(&mut self, ctx: &TaskContext) -> Result<R, TaskError> {
        (self.body)(ctx)
    }
}

impl<R: Send + 'static> TaskFactory<R> for FnTaskFactory<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_task(&self) -> Result<Option<Box<dyn Task<R>>>, TaskError> {
        Ok(Some(Box::new(FnTask {
            body: Arc::clone(&self.body),
        })))
    }

    fn requested_computation_token_count(&self) -> usize {
        self.token_count
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }

    fn environment_selector(&self) -> SharedSelector {
        Arc::clone(&self.selector)
    }
}
