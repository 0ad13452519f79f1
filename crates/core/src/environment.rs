//! Execution environments and the selection protocol run against them.
//!
//! Selectors only ever see an [`EnvironmentView`], which exposes properties
//! but not identity, so a selection decision can be replayed on any
//! environment with the same properties.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;

pub type PropertyMap = BTreeMap<String, Value>;

/// Stable identity of an execution environment (the local one or a cluster).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId(Uuid);

impl EnvironmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, used for thread names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Environment ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    id: EnvironmentId,
    properties: PropertyMap,
}

impl ExecutionEnvironment {
    pub fn new() -> Self {
        Self::with_id(EnvironmentId::new())
    }

    pub fn with_id(id: EnvironmentId) -> Self {
        Self {
            id,
            properties: PropertyMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn view(&self) -> EnvironmentView<'_> {
        EnvironmentView {
            properties: &self.properties,
        }
    }
}

impl Default for ExecutionEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity-free view handed to selectors.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentView<'a> {
    properties: &'a PropertyMap,
}

impl<'a> EnvironmentView<'a> {
    pub fn property(&self, key: &str) -> Option<&'a Value> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &'a PropertyMap {
        self.properties
    }
}

// ── Selection ──────────────────────────────────────────

/// What a selector reports when an environment is suitable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentSelection {
    /// Properties whose current values made the environment suitable.
    pub qualifier_properties: PropertyMap,
    /// Properties the task will modify in the environment it runs in.
    pub modified_properties: BTreeSet<String>,
}

impl EnvironmentSelection {
    pub fn qualified_by(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.qualifier_properties.insert(key.into(), value.into());
        self
    }
}

/// Immutable record of the environment chosen for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub environment_id: EnvironmentId,
    pub qualifier_properties: PropertyMap,
    pub modified_properties: BTreeSet<String>,
}

impl SelectionResult {
    pub fn new(environment_id: EnvironmentId, selection: EnvironmentSelection) -> Self {
        Self {
            environment_id,
            qualifier_properties: selection.qualifier_properties,
            modified_properties: selection.modified_properties,
        }
    }

    /// An environment qualifies when every qualifier property has the same
    /// current value there.
    pub fn qualifies(&self, environment: &ExecutionEnvironment) -> bool {
        self.qualifier_properties
            .iter()
            .all(|(key, value)| environment.properties().get(key) == Some(value))
    }
}

pub trait EnvironmentSelector: Send + Sync {
    /// `Ok(None)` means unsuitable. Must not depend on environment identity.
    fn is_suitable(
        &self,
        environment: &EnvironmentView<'_>,
    ) -> Result<Option<EnvironmentSelection>, TaskError>;

    /// Selection never leaves the local environment.
    fn restricted_to_local(&self) -> bool {
        false
    }
}

pub type SharedSelector = Arc<dyn EnvironmentSelector>;

/// Accepts every environment without qualifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyEnvironmentSelector;

impl EnvironmentSelector for AnyEnvironmentSelector {
    fn is_suitable(
        &self,
        _environment: &EnvironmentView<'_>,
    ) -> Result<Option<EnvironmentSelection>, TaskError> {
        Ok(Some(EnvironmentSelection::default()))
    }
}

/// Accepts only the local environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnlySelector;

impl EnvironmentSelector for LocalOnlySelector {
    fn is_suitable(
        &self,
        _environment: &EnvironmentView<'_>,
    ) -> Result<Option<EnvironmentSelection>, TaskError> {
        Ok(Some(EnvironmentSelection::default()))
    }

    fn restricted_to_local(&self) -> bool {
        true
    }
}

/// Suitable when a property has an exact value; the property becomes a qualifier.
#[derive(Debug, Clone)]
pub struct PropertySelector {
    key: String,
    value: Value,
}

impl PropertySelector {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl EnvironmentSelector for PropertySelector {
    fn is_suitable(
        &self,
        environment: &EnvironmentView<'_>,
    ) -> Result<Option<EnvironmentSelection>, TaskError> {
        Ok(match environment.property(&self.key) {
            Some(v) if *v == self.value => Some(
                EnvironmentSelection::default().qualified_by(self.key.clone(), self.value.clone()),
            ),
            _ => None,
        })
    }
}
