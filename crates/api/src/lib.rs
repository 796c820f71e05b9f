//! Trellis object accessor boundary.
//!
//! The engine never talks to storage directly. Everything goes through [`ObjectAccessor`],
//! implemented in-memory by `trellis-store` and against a cluster by `trellis-kubehub`.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use trellis_core::{EngineError, Object, ObjectKey};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Applied,
    Deleted,
}

/// A change delivered by a watch. Delivery is at-least-once and may be out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub object: Object,
}

/// Optional list filter: label equality selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListFilter {
    pub labels: Vec<(String, String)>,
}

impl ListFilter {
    pub fn label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.labels.push((k.into(), v.into()));
        self
    }

    pub fn matches(&self, o: &Object) -> bool {
        self.labels.iter().all(|(k, v)| o.labels.get(k) == Some(v))
    }

    /// Kubernetes label selector syntax (`a=b,c=d`).
    pub fn selector(&self) -> Option<String> {
        if self.labels.is_empty() { return None; }
        Some(self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
    }
}

/// Errors surfaced by an accessor.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("conflict on {0}: resource version is stale")]
    Conflict(ObjectKey),
    #[error("access cancelled")]
    Cancelled,
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl AccessError {
    pub fn is_not_found(&self) -> bool { matches!(self, AccessError::NotFound(_)) }
}

impl From<AccessError> for EngineError {
    fn from(e: AccessError) -> Self {
        match e {
            // Lost the object mid-cycle: start over from a fresh read.
            AccessError::NotFound(k) | AccessError::Conflict(k) => EngineError::Conflict(k),
            AccessError::Cancelled => EngineError::Cancelled,
            AccessError::Transient(e) => EngineError::Transient(e),
        }
    }
}

pub type AccessResult<T> = Result<T, AccessError>;

/// Typed object access keyed by `(kind, namespace, name)`.
///
/// Writes are optimistic: `update` and `update_status` fail with [`AccessError::Conflict`]
/// when the object's `resource_version` is not the stored one.
#[async_trait::async_trait]
pub trait ObjectAccessor: Send + Sync {
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> AccessResult<Object>;

    /// List objects of `kind`; `namespace == None` lists across all namespaces.
    async fn list(&self, kind: &str, namespace: Option<&str>, filter: Option<&ListFilter>) -> AccessResult<Vec<Object>>;

    async fn create(&self, object: &Object) -> AccessResult<Object>;

    /// Replace metadata (labels, finalizers) and spec.
    async fn update(&self, object: &Object) -> AccessResult<Object>;

    /// Replace the status sub-resource only.
    async fn update_status(&self, object: &Object) -> AccessResult<Object>;

    /// Request deletion. Objects holding finalizers are only marked as deleting.
    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> AccessResult<()>;

    /// Stream of changes for one kind. A (re)start replays every live object as `Applied`.
    async fn watch(&self, kind: &str) -> AccessResult<BoxStream<'static, AccessResult<ChangeEvent>>>;

    async fn get_key(&self, key: &ObjectKey) -> AccessResult<Object> {
        self.get(&key.kind, key.namespace(), &key.name).await
    }

    /// `get` mapping not-found to `None`.
    async fn get_opt(&self, kind: &str, namespace: Option<&str>, name: &str) -> AccessResult<Option<Object>> {
        match self.get(kind, namespace, name).await {
            Ok(o) => Ok(Some(o)),
            Err(AccessError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
