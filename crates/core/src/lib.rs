//! Trellis core types: objects, references, kinds, requeue actions and the error taxonomy.

#![forbid(unsafe_code)]

pub mod conditions;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use conditions::{Condition, ConditionSet, ConditionStatus, ConditionType, Reason};

/// API group served by the Trellis custom resources.
pub const API_GROUP: &str = "trellis.dev";
/// API version of the Trellis custom resources.
pub const API_VERSION: &str = "v1alpha1";

/// Static description of an object kind (group/version/kind + scope).
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub struct KindInfo {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub namespaced: bool,
}

impl KindInfo {
    pub const fn namespaced(group: &'static str, version: &'static str, kind: &'static str) -> Self {
        Self { group, version, kind, namespaced: true }
    }

    pub const fn cluster(group: &'static str, version: &'static str, kind: &'static str) -> Self {
        Self { group, version, kind, namespaced: false }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.to_string() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Identity of an object: `(kind, namespace, name)`. `namespace == None` means cluster-scoped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A pointer from one object to another.
///
/// `kind` is optional: name-only references get their kind from the field declaration,
/// and polymorphic targets default it from the request scope. An unset `namespace`
/// inherits the namespace of the referencing object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
}

impl Reference {
    pub fn named(name: impl Into<String>) -> Self {
        Self { kind: None, namespace: None, name: name.into() }
    }

    pub fn typed(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: Some(kind.into()), namespace: None, name: name.into() }
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Zero-valued references (empty name) carry no dependency.
    pub fn is_absent(&self) -> bool { self.name.is_empty() }

    /// Namespace the reference points into, given the namespace of the referencing object.
    pub fn effective_namespace<'a>(&'a self, source_ns: Option<&'a str>) -> Option<&'a str> {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Some(ns),
            _ => source_ns,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(k) = &self.kind { write!(f, "{} ", k)?; }
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Observed state of an object. The only part of an object the engine writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub conditions: ConditionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Observed dependency generations keyed by reference field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// A typed, named, versioned unit of declarative state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: Status,
}

impl Object {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
            uid: None,
            generation: 0,
            resource_version: None,
            labels: BTreeMap::new(),
            finalizers: Vec::new(),
            deletion_timestamp: None,
            spec: serde_json::Value::Null,
            status: Status::default(),
        }
    }

    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { kind: self.kind.clone(), namespace: self.namespace.clone(), name: self.name.clone() }
    }

    /// Readiness: a `Ready` condition exists with status `True`.
    pub fn is_ready(&self) -> bool { self.status.conditions.is_ready() }

    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, f: &str) -> bool { self.finalizers.iter().any(|x| x == f) }

    /// Returns true when the finalizer was added.
    pub fn add_finalizer(&mut self, f: &str) -> bool {
        if self.has_finalizer(f) { return false; }
        self.finalizers.push(f.to_string());
        true
    }

    /// Returns true when the finalizer was present.
    pub fn remove_finalizer(&mut self, f: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|x| x != f);
        before != self.finalizers.len()
    }

    /// Top-level spec field, `None` for missing or JSON null.
    pub fn spec_field(&self, field: &str) -> Option<&serde_json::Value> {
        self.spec.get(field).filter(|v| !v.is_null())
    }

    pub fn spec_str(&self, field: &str) -> Option<&str> {
        self.spec_field(field).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }
}

/// Instruction returned to the event loop after a reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change event.
    Done,
    /// Re-deliver the same key after the delay.
    RequeueAfter(Duration),
    /// Re-deliver the same key as soon as a worker is free.
    RequeueNow,
}

/// How an engine error is surfaced and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Optimistic-concurrency failure: retry immediately, conditions untouched.
    Conflict,
    /// Infrastructure noise: retry with backoff, conditions untouched.
    Transient,
    /// User must edit the object: surfaced in conditions, no automatic retry.
    Validation,
    /// Shutdown in progress: no retry.
    Cancelled,
}

/// Errors that abort a reconciliation cycle.
///
/// Missing or unready dependencies are not errors: they are resolution outcomes that
/// end the cycle with a `RequeueAfter`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("conflict writing {0}; object changed since it was read")]
    Conflict(ObjectKey),
    #[error("transient access error: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("{0}")]
    Validation(String),
    #[error("reconciliation cancelled")]
    Cancelled,
    #[error("reconciliation panicked: {0}")]
    Panicked(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Conflict(_) => ErrorClass::Conflict,
            EngineError::Transient(_) | EngineError::Panicked(_) => ErrorClass::Transient,
            EngineError::Validation(_) => ErrorClass::Validation,
            EngineError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

pub mod prelude {
    pub use super::{
        Action, Condition, ConditionSet, ConditionStatus, ConditionType, EngineError, EngineResult, ErrorClass,
        KindInfo, Object, ObjectKey, Reason, Reference, Status,
    };
}
