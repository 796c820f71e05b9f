//! Trellis reverse-dependency indexer.
//!
//! Answers "who points at X" for a changed object by scanning only the dependent kinds
//! registered against X's kind, in X's namespace, and only the declared reference paths.
//! The registration table is built once at startup and is read-only afterwards.

#![forbid(unsafe_code)]

pub mod path;

pub use path::{Cardinality, RefForm, RefPath, RefShape};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::debug;
use trellis_api::{AccessResult, ObjectAccessor};
use trellis_core::{Object, ObjectKey, Reference};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid reference path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("duplicate registration {target} -> {dependent} at {path}")]
    Duplicate { target: String, dependent: String, path: String },
}

/// Which dependents an untyped reference reaches through a registration.
///
/// A polymorphic target registers one variant per scope; a reference without a kind goes to
/// the variant matching the dependent's own scope, never to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Untyped {
    #[default]
    Any,
    /// Dependents in a namespace.
    Namespaced,
    /// Cluster-scoped dependents.
    Cluster,
}

impl Untyped {
    pub fn applies_to(self, dependent_namespace: Option<&str>) -> bool {
        let namespaced = dependent_namespace.is_some_and(|ns| !ns.is_empty());
        match self {
            Untyped::Any => true,
            Untyped::Namespaced => namespaced,
            Untyped::Cluster => !namespaced,
        }
    }
}

/// `{target kind, dependent kind, reference path}`, plus the name substituted when the path is unset.
#[derive(Debug, Clone)]
pub struct Registration {
    pub target_kind: String,
    pub dependent_kind: String,
    pub path: RefPath,
    pub default_name: Option<String>,
    pub untyped: Untyped,
}

impl Registration {
    /// Whether `reference`, found on `dependent`, names the object `changed`.
    ///
    /// Kind defaults to the registration's target kind when [`Untyped`] allows it for the
    /// dependent; namespace defaults to the dependent's own. Cluster-scoped targets match on
    /// name and kind alone.
    pub fn points_at(&self, reference: &Reference, dependent: &Object, changed: &ObjectKey) -> bool {
        if reference.name != changed.name {
            return false;
        }
        let kind = match reference.kind.as_deref().filter(|k| !k.is_empty()) {
            Some(k) => k,
            None if self.untyped.applies_to(dependent.namespace.as_deref()) => self.target_kind.as_str(),
            None => return false,
        };
        if kind != changed.kind {
            return false;
        }
        match changed.namespace() {
            None => true,
            Some(ns) => reference.effective_namespace(dependent.namespace.as_deref()) == Some(ns),
        }
    }
}

/// Immutable registration table keyed by target kind.
#[derive(Debug, Default)]
pub struct Registry {
    by_target: FxHashMap<String, Vec<Registration>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder { RegistryBuilder::default() }

    pub fn for_target(&self, kind: &str) -> &[Registration] {
        self.by_target.get(kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn target_kinds(&self) -> impl Iterator<Item = &str> { self.by_target.keys().map(|k| k.as_str()) }

    pub fn len(&self) -> usize { self.by_target.values().map(|v| v.len()).sum() }
    pub fn is_empty(&self) -> bool { self.by_target.is_empty() }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    regs: Vec<Registration>,
}

impl RegistryBuilder {
    pub fn register(self, target_kind: &str, dependent_kind: &str, path: &str, shape: RefShape) -> Result<Self, IndexError> {
        self.register_with_default(target_kind, dependent_kind, path, shape, None)
    }

    /// Like [`RegistryBuilder::register`]; dependents leaving the path unset point at `default_name`.
    pub fn register_with_default(
        self,
        target_kind: &str,
        dependent_kind: &str,
        path: &str,
        shape: RefShape,
        default_name: Option<&str>,
    ) -> Result<Self, IndexError> {
        self.register_variant(target_kind, dependent_kind, path, shape, default_name, Untyped::Any)
    }

    /// Register one variant of a polymorphic target.
    pub fn register_variant(
        mut self,
        target_kind: &str,
        dependent_kind: &str,
        path: &str,
        shape: RefShape,
        default_name: Option<&str>,
        untyped: Untyped,
    ) -> Result<Self, IndexError> {
        let path = RefPath::parse(path, shape)?;
        let dup = self.regs.iter().any(|r| {
            r.target_kind == target_kind && r.dependent_kind == dependent_kind && r.path.as_str() == path.as_str()
        });
        if dup {
            return Err(IndexError::Duplicate {
                target: target_kind.to_string(),
                dependent: dependent_kind.to_string(),
                path: path.as_str().to_string(),
            });
        }
        self.regs.push(Registration {
            target_kind: target_kind.to_string(),
            dependent_kind: dependent_kind.to_string(),
            path,
            default_name: default_name.map(|s| s.to_string()),
            untyped,
        });
        Ok(self)
    }

    pub fn build(self) -> Arc<Registry> {
        let mut by_target: FxHashMap<String, Vec<Registration>> = FxHashMap::default();
        for r in self.regs {
            by_target.entry(r.target_kind.clone()).or_default().push(r);
        }
        Arc::new(Registry { by_target })
    }
}

/// Collect dependents among `candidates` that reference `changed` through `reg`.
pub fn matching_dependents(reg: &Registration, changed: &ObjectKey, candidates: &[Object], out: &mut BTreeSet<ObjectKey>) {
    for dep in candidates {
        if dep.kind != reg.dependent_kind {
            continue;
        }
        let mut refs = reg.path.references(dep);
        if refs.is_empty() {
            if let Some(d) = &reg.default_name {
                refs.push(Reference::named(d.as_str()));
            }
        }
        if refs.iter().any(|r| reg.points_at(r, dep, changed)) {
            out.insert(dep.key());
        }
    }
}

pub struct Indexer {
    registry: Arc<Registry>,
    accessor: Arc<dyn ObjectAccessor>,
}

impl Indexer {
    pub fn new(registry: Arc<Registry>, accessor: Arc<dyn ObjectAccessor>) -> Self { Self { registry, accessor } }

    pub fn registry(&self) -> &Arc<Registry> { &self.registry }

    /// Dependents that must be re-evaluated because `changed` changed. Sorted, deduplicated.
    pub async fn invalidate(&self, changed: &Object) -> AccessResult<Vec<ObjectKey>> {
        let t0 = Instant::now();
        let key = changed.key();
        let regs = self.registry.for_target(&key.kind);
        if regs.is_empty() {
            return Ok(Vec::new());
        }
        let mut listed: FxHashMap<&str, Vec<Object>> = FxHashMap::default();
        let mut out = BTreeSet::new();
        for reg in regs {
            if !listed.contains_key(reg.dependent_kind.as_str()) {
                let objs = self.accessor.list(&reg.dependent_kind, key.namespace(), None).await?;
                listed.insert(reg.dependent_kind.as_str(), objs);
            }
            if let Some(candidates) = listed.get(reg.dependent_kind.as_str()) {
                matching_dependents(reg, &key, candidates, &mut out);
            }
        }
        let out: Vec<ObjectKey> = out.into_iter().collect();
        counter!("invalidate_dependents_total", out.len() as u64);
        histogram!("invalidate_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(changed = %key, dependents = out.len(), "invalidate");
        Ok(out)
    }
}
