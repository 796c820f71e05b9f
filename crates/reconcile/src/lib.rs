//! Trellis reconciliation orchestrator.
//!
//! A cycle for one object:
//! 1. deleting objects run their finalizer cleanup and release the finalizer;
//! 2. the kind's finalizer is registered before the first successful pass;
//! 3. declared reference fields resolve in declaration order, the first unsatisfied one ends
//!    the cycle with a requeue;
//! 4. kind-specific work runs, then `Ready=True`.
//!
//! Every exit path goes through [`InFlight::finish`], which settles the status write.

#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod guard;

pub use config::Config;
pub use controller::{Controller, ControllerBuilder, DrainReport};
pub use guard::InFlight;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use trellis_api::ObjectAccessor;
use trellis_core::{
    Action, ConditionStatus, ConditionType, EngineError, EngineResult, KindInfo, Object, Reason,
};
use trellis_resolve::{RefField, Resolution, Resolver};

/// Shared collaborators handed to every reconciler.
pub struct Context {
    pub accessor: Arc<dyn ObjectAccessor>,
    pub resolver: Resolver,
    pub config: Config,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(accessor: Arc<dyn ObjectAccessor>, config: Config) -> Self {
        let resolver = Resolver::new(accessor.clone(), config.requeue_delay);
        Self { accessor, resolver, config, cancel: CancellationToken::new() }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Ready targets of one object's references, by field name.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    by_field: BTreeMap<&'static str, Vec<Object>>,
}

impl Dependencies {
    fn push(&mut self, field: &'static str, target: Object) { self.by_field.entry(field).or_default().push(target); }

    /// First target of a scalar field; `None` when the field is unset.
    pub fn get(&self, field: &str) -> Option<&Object> { self.by_field.get(field).and_then(|v| v.first()) }

    pub fn all(&self, field: &str) -> &[Object] { self.by_field.get(field).map(|v| v.as_slice()).unwrap_or(&[]) }

    /// Status attribute entries: `field[.name] -> Kind/name@generation`.
    pub fn attributes(&self, fields: &[RefField]) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for f in fields {
            let targets = self.all(f.name);
            let is_map = matches!(f.shape.cardinality, trellis_index::Cardinality::Map);
            for t in targets {
                let key = if is_map { format!("{}.{}", f.name, t.name) } else { f.name.to_string() };
                out.insert(key, format!("{}/{}@{}", t.kind, t.name, t.generation));
            }
        }
        out
    }
}

/// Kind-specific part of reconciliation.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> KindInfo;

    /// Reference fields in declaration order. Resolution follows this order.
    fn references(&self) -> &'static [RefField] { &[] }

    /// Marker held while the object owns derived state outside itself.
    fn finalizer(&self) -> Option<&'static str> { None }

    /// Runs once every reference resolved ready. Content problems return
    /// `EngineError::Validation`.
    async fn apply(&self, ctx: &Context, object: &mut Object, deps: &Dependencies) -> EngineResult<()>;

    /// Remove derived state before the finalizer is released.
    async fn cleanup(&self, _ctx: &Context, _object: &Object) -> EngineResult<()> { Ok(()) }
}

/// Lifecycle phase derived from an object's conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Phase {
    Initializing,
    Progressing,
    Ready,
    Degraded,
    Finalizing,
}

impl Phase {
    pub fn of(object: &Object) -> Phase {
        let cs = &object.status.conditions;
        if object.is_deleting() {
            Phase::Finalizing
        } else if cs.is_empty() {
            Phase::Initializing
        } else if cs.is_true(ConditionType::Degraded) {
            Phase::Degraded
        } else if cs.is_true(ConditionType::Progressing) {
            Phase::Progressing
        } else if cs.is_ready() {
            Phase::Ready
        } else {
            Phase::Progressing
        }
    }
}

/// Run one reconciliation cycle for `object`.
pub async fn reconcile(ctx: &Context, reconciler: &dyn Reconciler, object: Object) -> EngineResult<Action> {
    let mut guard = InFlight::begin(object);
    let result = match AssertUnwindSafe(cycle(ctx, reconciler, &mut guard)).catch_unwind().await {
        Ok(r) => r,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(EngineError::Panicked(msg))
        }
    };
    guard.finish(ctx.accessor.as_ref(), result).await
}

async fn cycle(ctx: &Context, reconciler: &dyn Reconciler, guard: &mut InFlight) -> EngineResult<Action> {
    if guard.object().is_deleting() {
        return finalize(ctx, reconciler, guard).await;
    }

    if let Some(f) = reconciler.finalizer() {
        if !guard.object().has_finalizer(f) {
            let mut next = guard.object().clone();
            next.add_finalizer(f);
            let updated = ctx.accessor.update(&next).await?;
            guard.adopt(&updated);
            debug!(key = %guard.key(), finalizer = f, "finalizer registered");
        }
    }

    let now = Utc::now();
    let object = guard.object_mut();
    if object.status.observed_generation != Some(object.generation) {
        let msg = format!("reconciling generation {}", object.generation);
        if object.status.conditions.get(ConditionType::Ready).is_none() {
            object.status.conditions.set(ConditionType::Ready, ConditionStatus::Unknown, Reason::Reconciling, &msg, now);
        }
        object.status.conditions.set(ConditionType::Progressing, ConditionStatus::True, Reason::Reconciling, &msg, now);
    }

    let deps = match resolve_references(ctx, reconciler, object).await? {
        Ok(deps) => deps,
        Err(blocked) => {
            let message = object
                .status
                .conditions
                .get(ConditionType::Ready)
                .map(|c| c.message.clone())
                .unwrap_or_default();
            object.status.conditions.set_conditions(
                &[(ConditionType::Progressing, ConditionStatus::True), (ConditionType::Degraded, ConditionStatus::False)],
                Reason::ReconcileError,
                &message,
                now,
            );
            object.status.observed_generation = Some(object.generation);
            info!(key = %object.key(), %message, "waiting for dependency");
            return Ok(blocked.requeue(ctx.config.requeue_delay).unwrap_or(Action::RequeueAfter(ctx.config.requeue_delay)));
        }
    };

    reconciler.apply(ctx, object, &deps).await?;

    object.status.conditions.set_conditions(
        &[
            (ConditionType::Ready, ConditionStatus::True),
            (ConditionType::Progressing, ConditionStatus::False),
            (ConditionType::Degraded, ConditionStatus::False),
        ],
        Reason::Reconciled,
        "",
        Utc::now(),
    );
    object.status.observed_generation = Some(object.generation);
    object.status.attributes = deps.attributes(reconciler.references());
    Ok(Action::Done)
}

/// Resolve every declared reference in order. `Err` carries the first unsatisfied outcome.
async fn resolve_references(
    ctx: &Context,
    reconciler: &dyn Reconciler,
    object: &mut Object,
) -> EngineResult<Result<Dependencies, Resolution>> {
    let resolver = ctx.resolver.scoped(object);
    let mut deps = Dependencies::default();
    for field in reconciler.references() {
        let refs = field.references(object).map_err(|e| EngineError::Validation(e.to_string()))?;
        for (reference, origin) in refs {
            match resolver.resolve(object, &field.target, Some(&reference), origin).await? {
                Resolution::Ready(Some(target)) => deps.push(field.name, target),
                Resolution::Ready(None) => {}
                unsatisfied => return Ok(Err(unsatisfied)),
            }
        }
    }
    Ok(Ok(deps))
}

async fn finalize(ctx: &Context, reconciler: &dyn Reconciler, guard: &mut InFlight) -> EngineResult<Action> {
    let f = match reconciler.finalizer() {
        Some(f) if guard.object().has_finalizer(f) => f,
        _ => {
            // Not ours to hold up; the store removes the object once other finalizers clear.
            guard.detach();
            return Ok(Action::Done);
        }
    };
    info!(key = %guard.key(), "finalizing");
    guard.object_mut().status.conditions.set(
        ConditionType::Ready,
        ConditionStatus::False,
        Reason::Finalizing,
        "removing derived resources",
        Utc::now(),
    );
    reconciler.cleanup(ctx, guard.object()).await?;
    let mut next = guard.object().clone();
    next.remove_finalizer(f);
    ctx.accessor.update(&next).await?;
    guard.detach();
    Ok(Action::Done)
}
