//! Trellis site kinds.
//!
//! Pages reference a header, a footer and any number of navigations; headers reference a
//! script bundle that is either namespaced or cluster-wide. Each kind declares its reference
//! fields once; the same table drives resolution, reverse-index registration and `kinds` output.

#![forbid(unsafe_code)]

pub mod bundle;
pub mod page;
pub mod template;
pub mod validate;

use std::sync::Arc;

use trellis_api::ObjectAccessor;
use trellis_core::{KindInfo, API_GROUP, API_VERSION};
use trellis_index::{IndexError, RefShape};
use trellis_reconcile::{Config, Controller, ControllerBuilder, Reconciler};
use trellis_resolve::{DefaultRef, RefField, TargetKind};

pub use bundle::BundleReconciler;
pub use page::PageReconciler;
pub use template::TemplateReconciler;
pub use validate::{ContentValidator, DelimiterValidator, PackageNameValidator, RegistryValidator};

pub const PAGE: KindInfo = KindInfo::namespaced(API_GROUP, API_VERSION, "Page");
pub const HEADER: KindInfo = KindInfo::namespaced(API_GROUP, API_VERSION, "Header");
pub const FOOTER: KindInfo = KindInfo::namespaced(API_GROUP, API_VERSION, "Footer");
pub const NAVIGATION: KindInfo = KindInfo::namespaced(API_GROUP, API_VERSION, "Navigation");
pub const SCRIPT_BUNDLE: KindInfo = KindInfo::namespaced(API_GROUP, API_VERSION, "ScriptBundle");
pub const CLUSTER_SCRIPT_BUNDLE: KindInfo = KindInfo::cluster(API_GROUP, API_VERSION, "ClusterScriptBundle");
/// Derived output of a page.
pub const CONFIG_MAP: KindInfo = KindInfo::namespaced("", "v1", "ConfigMap");

/// Kinds the site controller reconciles.
pub const KINDS: [KindInfo; 6] = [PAGE, HEADER, FOOTER, NAVIGATION, SCRIPT_BUNDLE, CLUSTER_SCRIPT_BUNDLE];

pub static PAGE_REFS: [RefField; 3] = [
    RefField {
        name: "header",
        path: "spec.header",
        shape: RefShape::NAME,
        target: TargetKind::Fixed(HEADER),
        default: Some(DefaultRef { name: "default", required: false }),
    },
    RefField { name: "footer", path: "spec.footer", shape: RefShape::OPTIONAL_NAME, target: TargetKind::Fixed(FOOTER), default: None },
    RefField {
        name: "extraNavigations",
        path: "spec.extraNavigations",
        shape: RefShape::TYPED_MAP,
        target: TargetKind::Fixed(NAVIGATION),
        default: None,
    },
];

pub static HEADER_REFS: [RefField; 1] = [RefField {
    name: "scriptBundle",
    path: "spec.scriptBundle",
    shape: RefShape::OPTIONAL_TYPED,
    target: TargetKind::Polymorphic { namespaced: SCRIPT_BUNDLE, cluster: CLUSTER_SCRIPT_BUNDLE },
    default: None,
}];

/// Look up a site kind by its `kind` name.
pub fn kind_info(kind: &str) -> Option<KindInfo> {
    KINDS.iter().chain(std::iter::once(&CONFIG_MAP)).find(|k| k.kind == kind).copied()
}

/// Reference fields declared by `kind`, in resolution order.
pub fn references_of(kind: &str) -> &'static [RefField] {
    match kind {
        "Page" => &PAGE_REFS,
        "Header" => &HEADER_REFS,
        _ => &[],
    }
}

/// Pluggable collaborators of the site reconcilers.
#[derive(Clone)]
pub struct Validators {
    pub content: Arc<dyn ContentValidator>,
    pub registry: Arc<dyn RegistryValidator>,
}

impl Default for Validators {
    fn default() -> Self { Self { content: Arc::new(DelimiterValidator), registry: Arc::new(PackageNameValidator) } }
}

/// One reconciler per site kind.
pub fn reconcilers(v: &Validators) -> Vec<Arc<dyn Reconciler>> {
    vec![
        Arc::new(PageReconciler::new(v.content.clone())),
        Arc::new(TemplateReconciler::new(HEADER, &HEADER_REFS, v.content.clone())),
        Arc::new(TemplateReconciler::new(FOOTER, &[], v.content.clone())),
        Arc::new(TemplateReconciler::new(NAVIGATION, &[], v.content.clone())),
        Arc::new(BundleReconciler::new(SCRIPT_BUNDLE, v.registry.clone())),
        Arc::new(BundleReconciler::new(CLUSTER_SCRIPT_BUNDLE, v.registry.clone())),
    ]
}

/// Controller builder with every site reconciler registered.
pub fn controller_builder(accessor: Arc<dyn ObjectAccessor>, config: Config, v: &Validators) -> ControllerBuilder {
    reconcilers(v).into_iter().fold(Controller::builder(accessor, config), |b, r| b.reconciler(r))
}

pub fn controller(accessor: Arc<dyn ObjectAccessor>, config: Config) -> Result<Arc<Controller>, IndexError> {
    controller_builder(accessor, config, &Validators::default()).build()
}
