//! Trellis reference resolver.
//!
//! One resolver for every target kind: fetch, classify, record the outcome on the source's
//! `Ready` condition and tell the orchestrator whether to continue or requeue.

#![forbid(unsafe_code)]

pub mod field;

pub use field::{DefaultRef, RefField, RefOrigin, Scope, TargetKind};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::debug;
use trellis_api::{AccessError, ObjectAccessor};
use trellis_core::{
    Action, ConditionStatus, ConditionType, EngineError, EngineResult, Object, ObjectKey, Reason, Reference,
};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unsupported reference kind {kind:?}, expected a {expected}")]
    UnsupportedKind { kind: String, expected: &'static str },
}

impl From<ResolveError> for EngineError {
    fn from(e: ResolveError) -> Self { EngineError::Validation(e.to_string()) }
}

/// Result of resolving one reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Target exists and is ready. `None` when no reference is configured.
    Ready(Option<Object>),
    NotFound(ObjectKey),
    /// Target exists but is not ready.
    NotReady(Object),
}

impl Resolution {
    pub fn is_ready(&self) -> bool { matches!(self, Resolution::Ready(_)) }

    pub fn target(&self) -> Option<&Object> {
        match self {
            Resolution::Ready(t) => t.as_ref(),
            Resolution::NotReady(t) => Some(t),
            Resolution::NotFound(_) => None,
        }
    }

    /// Requeue hint for unsatisfied outcomes; `None` when the cycle may continue.
    pub fn requeue(&self, delay: Duration) -> Option<Action> {
        match self {
            Resolution::Ready(_) => None,
            Resolution::NotFound(_) | Resolution::NotReady(_) => Some(Action::RequeueAfter(delay)),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Resolution::Ready(None) => "absent",
            Resolution::Ready(Some(_)) => "ready",
            Resolution::NotFound(_) => "not_found",
            Resolution::NotReady(_) => "not_ready",
        }
    }
}

pub struct Resolver {
    accessor: Arc<dyn ObjectAccessor>,
    requeue_delay: Duration,
}

impl Resolver {
    pub fn new(accessor: Arc<dyn ObjectAccessor>, requeue_delay: Duration) -> Self { Self { accessor, requeue_delay } }

    pub fn requeue_delay(&self) -> Duration { self.requeue_delay }

    /// Bind the variant strategy for every reference of one request.
    pub fn scoped(&self, source: &Object) -> ScopedResolver<'_> {
        ScopedResolver { resolver: self, scope: Scope::for_request(source.namespace.as_deref()) }
    }
}

/// Resolver bound to one request's scope.
pub struct ScopedResolver<'a> {
    resolver: &'a Resolver,
    scope: Scope,
}

impl ScopedResolver<'_> {
    pub fn scope(&self) -> Scope { self.scope }

    pub fn requeue_delay(&self) -> Duration { self.resolver.requeue_delay }

    /// Resolve `reference` from `source`. Unsatisfied outcomes set `Ready=False` with reason
    /// `ReconcileError` on the source; access errors leave the source untouched.
    pub async fn resolve(
        &self,
        source: &mut Object,
        target: &TargetKind,
        reference: Option<&Reference>,
        origin: RefOrigin,
    ) -> EngineResult<Resolution> {
        let reference = match reference.filter(|r| !r.is_absent()) {
            Some(r) => r,
            None => return Ok(Resolution::Ready(None)),
        };
        let kind = self.scope.variant(target, reference.kind.as_deref())?;
        let namespace = if kind.namespaced { reference.effective_namespace(source.namespace.as_deref()) } else { None };
        let key = ObjectKey::new(kind.kind, namespace, reference.name.as_str());

        let res = match self.resolver.accessor.get_key(&key).await {
            Ok(obj) if obj.is_ready() => Resolution::Ready(Some(obj)),
            Ok(obj) => {
                let msg = format!("dependency {} {:?} is not ready", kind.kind, reference.name);
                mark_unsatisfied(source, &msg);
                Resolution::NotReady(obj)
            }
            Err(AccessError::NotFound(_)) => match origin {
                RefOrigin::Default { required: false } => Resolution::Ready(None),
                RefOrigin::Default { required: true } => {
                    mark_unsatisfied(source, &format!("default {} {:?} not found", kind.kind, reference.name));
                    Resolution::NotFound(key)
                }
                RefOrigin::Explicit => {
                    mark_unsatisfied(source, &format!("{} {:?} not found", kind.kind, reference.name));
                    Resolution::NotFound(key)
                }
            },
            Err(e) => {
                counter!("resolve_total", 1u64, "outcome" => "error");
                return Err(e.into());
            }
        };
        counter!("resolve_total", 1u64, "outcome" => res.label());
        debug!(source = %source.key(), target = %kind.kind, name = %reference.name, outcome = res.label(), "resolve");
        Ok(res)
    }
}

fn mark_unsatisfied(source: &mut Object, message: &str) {
    source.status.conditions.set(ConditionType::Ready, ConditionStatus::False, Reason::ReconcileError, message, Utc::now());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_only_for_unsatisfied() {
        let d = Duration::from_secs(5);
        assert_eq!(Resolution::Ready(None).requeue(d), None);
        assert_eq!(Resolution::NotFound(ObjectKey::new("Header", Some("s"), "h")).requeue(d), Some(Action::RequeueAfter(d)));
        let t = Object::new("Header", Some("s"), "h");
        assert_eq!(Resolution::NotReady(t).requeue(d), Some(Action::RequeueAfter(d)));
    }
}
