//! Reference field declarations shared by the resolver and the reverse index.

use trellis_core::{KindInfo, Object, Reference};
use trellis_index::{IndexError, RefPath, RefShape, RegistryBuilder, Untyped};

use crate::ResolveError;

/// What a reference may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Fixed(KindInfo),
    /// One concept stored as a namespaced and a cluster-scoped kind.
    Polymorphic { namespaced: KindInfo, cluster: KindInfo },
}

impl TargetKind {
    pub fn variants(&self) -> impl Iterator<Item = KindInfo> {
        let (a, b) = match *self {
            TargetKind::Fixed(k) => (k, None),
            TargetKind::Polymorphic { namespaced, cluster } => (namespaced, Some(cluster)),
        };
        std::iter::once(a).chain(b)
    }

    /// Kind name used in messages when the variant is not known yet.
    pub fn display_kind(&self) -> &'static str {
        match self {
            TargetKind::Fixed(k) => k.kind,
            TargetKind::Polymorphic { namespaced, .. } => namespaced.kind,
        }
    }
}

/// Which variant to query, chosen once per request from the source's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

impl Scope {
    /// An empty or missing request namespace selects cluster-scoped variants.
    pub fn for_request(namespace: Option<&str>) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Scope::Namespaced,
            _ => Scope::Cluster,
        }
    }

    /// An explicit reference kind wins when it names one of the variants.
    pub fn variant(&self, target: &TargetKind, explicit: Option<&str>) -> Result<KindInfo, ResolveError> {
        if let Some(k) = explicit.filter(|k| !k.is_empty()) {
            return target
                .variants()
                .find(|v| v.kind == k)
                .ok_or_else(|| ResolveError::UnsupportedKind { kind: k.to_string(), expected: target.display_kind() });
        }
        Ok(match (self, target) {
            (_, TargetKind::Fixed(k)) => *k,
            (Scope::Namespaced, TargetKind::Polymorphic { namespaced, .. }) => *namespaced,
            (Scope::Cluster, TargetKind::Polymorphic { cluster, .. }) => *cluster,
        })
    }
}

/// Where a reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOrigin {
    /// Authored by the user: a missing target is an error.
    Explicit,
    /// Substituted fallback name. `required` decides whether a missing fallback is an error
    /// or simply "no dependency".
    Default { required: bool },
}

/// Substituted when a `One`-cardinality field is left unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRef {
    pub name: &'static str,
    pub required: bool,
}

/// A declared reference field of a dependent kind.
#[derive(Debug, Clone, Copy)]
pub struct RefField {
    /// Field name, also the key in status attributes.
    pub name: &'static str,
    pub path: &'static str,
    pub shape: RefShape,
    pub target: TargetKind,
    pub default: Option<DefaultRef>,
}

impl RefField {
    pub fn ref_path(&self) -> Result<RefPath, IndexError> { RefPath::parse(self.path, self.shape) }

    /// References of this field on `object`, in iteration order, with defaults applied.
    pub fn references(&self, object: &Object) -> Result<Vec<(Reference, RefOrigin)>, IndexError> {
        let refs = self.ref_path()?.references(object);
        if refs.is_empty() {
            return Ok(match self.default {
                Some(d) => vec![(Reference::named(d.name), RefOrigin::Default { required: d.required })],
                None => Vec::new(),
            });
        }
        Ok(refs.into_iter().map(|r| (r, RefOrigin::Explicit)).collect())
    }

    /// Add one reverse-index registration per target variant. Untyped references of a
    /// polymorphic field reach the variant [`Scope::for_request`] would pick.
    pub fn register(&self, dependent_kind: &str, builder: RegistryBuilder) -> Result<RegistryBuilder, IndexError> {
        let default = self.default.map(|d| d.name);
        let polymorphic = matches!(self.target, TargetKind::Polymorphic { .. });
        self.target.variants().try_fold(builder, |b, v| {
            let untyped = match (polymorphic, v.namespaced) {
                (false, _) => Untyped::Any,
                (true, true) => Untyped::Namespaced,
                (true, false) => Untyped::Cluster,
            };
            b.register_variant(v.kind, dependent_kind, self.path, self.shape, default, untyped)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEADER: KindInfo = KindInfo::namespaced("trellis.dev", "v1alpha1", "Header");
    const SB: KindInfo = KindInfo::namespaced("trellis.dev", "v1alpha1", "ScriptBundle");
    const CSB: KindInfo = KindInfo::cluster("trellis.dev", "v1alpha1", "ClusterScriptBundle");
    const BUNDLE: TargetKind = TargetKind::Polymorphic { namespaced: SB, cluster: CSB };

    #[test]
    fn scope_picks_variant_once() {
        let ns = Scope::for_request(Some("site"));
        let cl = Scope::for_request(Some(""));
        assert_eq!(ns, Scope::Namespaced);
        assert_eq!(cl, Scope::Cluster);
        assert_eq!(Scope::for_request(None), Scope::Cluster);
        assert_eq!(ns.variant(&BUNDLE, None).unwrap(), SB);
        assert_eq!(cl.variant(&BUNDLE, None).unwrap(), CSB);
        assert_eq!(ns.variant(&BUNDLE, Some("ClusterScriptBundle")).unwrap(), CSB);
        assert_eq!(ns.variant(&TargetKind::Fixed(HEADER), None).unwrap(), HEADER);
        assert!(matches!(ns.variant(&BUNDLE, Some("Header")), Err(ResolveError::UnsupportedKind { .. })));
    }

    #[test]
    fn unset_field_falls_back_to_default() {
        let field = RefField {
            name: "header",
            path: "spec.header",
            shape: RefShape::NAME,
            target: TargetKind::Fixed(HEADER),
            default: Some(DefaultRef { name: "default", required: false }),
        };
        let unset = Object::new("Page", Some("site"), "home").with_spec(json!({}));
        assert_eq!(
            field.references(&unset).unwrap(),
            vec![(Reference::named("default"), RefOrigin::Default { required: false })]
        );
        let set = Object::new("Page", Some("site"), "home").with_spec(json!({"header": "main"}));
        assert_eq!(field.references(&set).unwrap(), vec![(Reference::named("main"), RefOrigin::Explicit)]);
    }

    #[test]
    fn polymorphic_field_registers_every_variant() {
        let field = RefField {
            name: "scriptBundle",
            path: "spec.scriptBundle",
            shape: RefShape::OPTIONAL_TYPED,
            target: BUNDLE,
            default: None,
        };
        let reg = field.register("Header", trellis_index::Registry::builder()).unwrap().build();
        assert_eq!(reg.for_target("ScriptBundle")[0].untyped, Untyped::Namespaced);
        assert_eq!(reg.for_target("ClusterScriptBundle")[0].untyped, Untyped::Cluster);

        // Same choice the resolver makes for an untyped reference from a namespaced header.
        let header = Object::new("Header", Some("site"), "h").with_spec(json!({"scriptBundle": {"name": "core"}}));
        let (reference, _) = field.references(&header).unwrap().remove(0);
        let picked = Scope::for_request(header.namespace.as_deref()).variant(&BUNDLE, reference.kind.as_deref()).unwrap();
        let csb = trellis_core::ObjectKey::new("ClusterScriptBundle", None, "core");
        let sb = trellis_core::ObjectKey::new("ScriptBundle", Some("site"), "core");
        assert_eq!(picked, SB);
        assert!(reg.for_target("ScriptBundle")[0].points_at(&reference, &header, &sb));
        assert!(!reg.for_target("ClusterScriptBundle")[0].points_at(&reference, &header, &csb));
    }
}
