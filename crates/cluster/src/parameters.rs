//! How an inner task is spread over the cluster.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use kiln_compute::{DuplicationPredicate, SerializedPredicate};
use kiln_core::EnvironmentId;

pub type PredicateFactory = dyn Fn() -> Arc<dyn DuplicationPredicate> + Send + Sync;

/// Source of the duplication predicate each contributing environment uses.
#[derive(Clone, Default)]
pub enum DuplicationMode {
    /// One invocation per environment.
    #[default]
    Once,
    /// One predicate shared by every environment; evaluations are serialized.
    Coordinated(Arc<dyn DuplicationPredicate>),
    /// A fresh predicate per environment.
    PerEnvironment(Arc<PredicateFactory>),
}

impl DuplicationMode {
    pub fn coordinated(predicate: impl DuplicationPredicate + 'static) -> Self {
        Self::Coordinated(Arc::new(predicate))
    }

    pub fn per_environment<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn DuplicationPredicate> + Send + Sync + 'static,
    {
        Self::PerEnvironment(Arc::new(factory))
    }

    /// Resolve into what a single request hands its contributors.
    pub(crate) fn into_source(self) -> PredicateSource {
        match self {
            Self::Once => PredicateSource::Once,
            Self::Coordinated(predicate) => {
                let serialized: Arc<dyn DuplicationPredicate> =
                    Arc::new(SerializedPredicate::new(move || predicate.should_invoke_once_more()));
                PredicateSource::Shared(serialized)
            }
            Self::PerEnvironment(factory) => PredicateSource::Fresh(factory),
        }
    }
}

impl fmt::Debug for DuplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Once => "Once",
            Self::Coordinated(_) => "Coordinated",
            Self::PerEnvironment(_) => "PerEnvironment",
        })
    }
}

pub(crate) enum PredicateSource {
    Once,
    Shared(Arc<dyn DuplicationPredicate>),
    Fresh(Arc<PredicateFactory>),
}

impl PredicateSource {
    pub(crate) fn for_contributor(&self) -> Option<Arc<dyn DuplicationPredicate>> {
        match self {
            Self::Once => None,
            Self::Shared(predicate) => Some(Arc::clone(predicate)),
            Self::Fresh(factory) => Some(factory()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InnerTaskParameters {
    /// Environments that may contribute: `< 0` every one, `> 1` at most that
    /// many, otherwise only the selected environment.
    pub cluster_duplicate_factor: i32,
    /// Per-environment ceiling on concurrent invocations; `<= 0` is unlimited.
    pub max_environment_factor: i32,
    pub duplication_cancellable: bool,
    /// `None` allows every environment.
    pub allowed_environments: Option<BTreeSet<EnvironmentId>>,
    pub duplication: DuplicationMode,
}

impl Default for InnerTaskParameters {
    fn default() -> Self {
        Self {
            cluster_duplicate_factor: 1,
            max_environment_factor: 0,
            duplication_cancellable: true,
            allowed_environments: None,
            duplication: DuplicationMode::Once,
        }
    }
}

impl InnerTaskParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster_duplicate_factor(mut self, factor: i32) -> Self {
        self.cluster_duplicate_factor = factor;
        self
    }

    pub fn with_max_environment_factor(mut self, factor: i32) -> Self {
        self.max_environment_factor = factor;
        self
    }

    pub fn with_duplication_cancellable(mut self, cancellable: bool) -> Self {
        self.duplication_cancellable = cancellable;
        self
    }

    pub fn with_allowed_environments(
        mut self,
        environments: impl IntoIterator<Item = EnvironmentId>,
    ) -> Self {
        self.allowed_environments = Some(environments.into_iter().collect());
        self
    }

    pub fn with_duplication(mut self, mode: DuplicationMode) -> Self {
        self.duplication = mode;
        self
    }

    pub fn fans_out(&self) -> bool {
        self.cluster_duplicate_factor < 0 || self.cluster_duplicate_factor > 1
    }

    /// How many environments may contribute; `None` is unlimited.
    pub fn contributor_budget(&self) -> Option<usize> {
        match self.cluster_duplicate_factor {
            f if f < 0 => None,
            f if f > 1 => usize::try_from(f).ok(),
            _ => Some(1),
        }
    }

    pub fn allows(&self, environment: EnvironmentId) -> bool {
        self.allowed_environments
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&environment))
    }
}
