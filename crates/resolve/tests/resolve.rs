#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use trellis_core::{Action, ConditionStatus, ConditionType, EngineError, KindInfo, Object, Reason, Reference};
use trellis_resolve::{RefOrigin, Resolution, Resolver, TargetKind};
use trellis_store::MemoryStore;

const HEADER: TargetKind = TargetKind::Fixed(KindInfo::namespaced("trellis.dev", "v1alpha1", "Header"));
const BUNDLE: TargetKind = TargetKind::Polymorphic {
    namespaced: KindInfo::namespaced("trellis.dev", "v1alpha1", "ScriptBundle"),
    cluster: KindInfo::cluster("trellis.dev", "v1alpha1", "ClusterScriptBundle"),
};

fn setup(delay_secs: u64) -> (Arc<MemoryStore>, Resolver) {
    let store = Arc::new(MemoryStore::new());
    let resolver = Resolver::new(store.clone(), Duration::from_secs(delay_secs));
    (store, resolver)
}

fn ready(mut o: Object) -> Object {
    o.status.conditions.set(ConditionType::Ready, ConditionStatus::True, Reason::Reconciled, "", Utc::now());
    o
}

fn page() -> Object { Object::new("Page", Some("site"), "page1") }

fn ready_condition(o: &Object) -> (ConditionStatus, String, String) {
    let c = o.status.conditions.get(ConditionType::Ready).expect("Ready condition set");
    (c.status, c.reason.clone(), c.message.clone())
}

#[tokio::test]
async fn absent_reference_is_vacuously_ready() {
    let (_store, resolver) = setup(5);
    let mut src = page();
    let r = resolver.scoped(&src).resolve(&mut src, &HEADER, None, RefOrigin::Explicit).await.unwrap();
    assert_eq!(r, Resolution::Ready(None));
    let empty = Reference::named("");
    let r = resolver.scoped(&src).resolve(&mut src, &HEADER, Some(&empty), RefOrigin::Explicit).await.unwrap();
    assert_eq!(r, Resolution::Ready(None));
    assert!(src.status.conditions.is_empty());
}

#[tokio::test]
async fn missing_target_marks_source_and_requeues_with_configured_delay() {
    let (_store, resolver) = setup(5);
    let mut src = page();
    let r = resolver
        .scoped(&src)
        .resolve(&mut src, &HEADER, Some(&Reference::named("Header1")), RefOrigin::Explicit)
        .await
        .unwrap();
    assert!(matches!(r, Resolution::NotFound(ref k) if k.name == "Header1" && k.namespace.as_deref() == Some("site")));
    assert_eq!(r.requeue(resolver.requeue_delay()), Some(Action::RequeueAfter(Duration::from_secs(5))));
    let (status, reason, message) = ready_condition(&src);
    assert_eq!(status, ConditionStatus::False);
    assert_eq!(reason, "ReconcileError");
    assert!(message.contains("Header1"), "message: {}", message);
}

#[tokio::test]
async fn unready_target_does_not_leak_its_message() {
    let (store, resolver) = setup(5);
    let mut hdr = Object::new("Header", Some("site"), "main");
    hdr.status.conditions.set(
        ConditionType::Ready,
        ConditionStatus::False,
        Reason::ValidationFailed,
        "unbalanced template delimiters",
        Utc::now(),
    );
    store.put(hdr);

    let mut src = page();
    let r = resolver
        .scoped(&src)
        .resolve(&mut src, &HEADER, Some(&Reference::named("main")), RefOrigin::Explicit)
        .await
        .unwrap();
    assert!(matches!(r, Resolution::NotReady(ref t) if t.name == "main"));
    let (status, reason, message) = ready_condition(&src);
    assert_eq!(status, ConditionStatus::False);
    assert_eq!(reason, "ReconcileError");
    assert!(!message.contains("delimiters"));
    assert!(message.contains("not ready"));
}

#[tokio::test]
async fn ready_target_is_returned() {
    let (store, resolver) = setup(5);
    store.put(ready(Object::new("Header", Some("site"), "main")));
    let mut src = page();
    let r = resolver
        .scoped(&src)
        .resolve(&mut src, &HEADER, Some(&Reference::named("main")), RefOrigin::Explicit)
        .await
        .unwrap();
    assert_eq!(r.target().map(|t| t.name.as_str()), Some("main"));
    assert!(src.status.conditions.is_empty());
}

#[tokio::test]
async fn access_errors_propagate_without_touching_conditions() {
    let (store, resolver) = setup(5);
    store.set_unavailable("Header", true);
    let mut src = page();
    let err = resolver
        .scoped(&src)
        .resolve(&mut src, &HEADER, Some(&Reference::named("main")), RefOrigin::Explicit)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transient(_)));
    assert!(src.status.conditions.is_empty());
}

#[tokio::test]
async fn explicit_namespace_overrides_source_namespace() {
    let (store, resolver) = setup(5);
    store.put(ready(Object::new("Header", Some("shared"), "main")));
    let mut src = page();
    let r = resolver
        .scoped(&src)
        .resolve(&mut src, &HEADER, Some(&Reference::named("main").in_namespace("shared")), RefOrigin::Explicit)
        .await
        .unwrap();
    assert!(r.is_ready());
}

#[tokio::test]
async fn polymorphic_target_follows_request_scope() {
    let (store, resolver) = setup(5);
    store.put(ready(Object::new("ScriptBundle", Some("site"), "core")));
    store.put(ready(Object::new("ClusterScriptBundle", None, "core")));

    let mut namespaced = Object::new("Header", Some("site"), "main");
    let r = resolver
        .scoped(&namespaced)
        .resolve(&mut namespaced, &BUNDLE, Some(&Reference::named("core")), RefOrigin::Explicit)
        .await
        .unwrap();
    assert_eq!(r.target().map(|t| t.kind.as_str()), Some("ScriptBundle"));

    let mut cluster = Object::new("Header", None, "main");
    let r = resolver
        .scoped(&cluster)
        .resolve(&mut cluster, &BUNDLE, Some(&Reference::named("core")), RefOrigin::Explicit)
        .await
        .unwrap();
    assert_eq!(r.target().map(|t| t.kind.as_str()), Some("ClusterScriptBundle"));

    // an explicit kind picks the variant regardless of scope
    let r = resolver
        .scoped(&namespaced)
        .resolve(&mut namespaced, &BUNDLE, Some(&Reference::typed("ClusterScriptBundle", "core")), RefOrigin::Explicit)
        .await
        .unwrap();
    assert_eq!(r.target().and_then(|t| t.namespace.clone()), None);

    let err = resolver
        .scoped(&namespaced)
        .resolve(&mut namespaced, &BUNDLE, Some(&Reference::typed("Footer", "core")), RefOrigin::Explicit)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn missing_default_depends_on_policy() {
    let (_store, resolver) = setup(5);
    let fallback = Reference::named("default");

    let mut src = page();
    let r = resolver
        .scoped(&src)
        .resolve(&mut src, &HEADER, Some(&fallback), RefOrigin::Default { required: false })
        .await
        .unwrap();
    assert_eq!(r, Resolution::Ready(None));
    assert!(src.status.conditions.is_empty());

    let r = resolver
        .scoped(&src)
        .resolve(&mut src, &HEADER, Some(&fallback), RefOrigin::Default { required: true })
        .await
        .unwrap();
    assert!(matches!(r, Resolution::NotFound(_)));
    let (_, _, message) = ready_condition(&src);
    assert!(message.starts_with("default Header"), "message: {}", message);
}
