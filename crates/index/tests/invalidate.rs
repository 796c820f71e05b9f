#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::json;
use trellis_core::{Object, ObjectKey};
use trellis_index::{Indexer, RefShape, Registry};
use trellis_store::MemoryStore;

fn registry() -> Arc<Registry> {
    Registry::builder()
        .register("Header", "Page", "spec.header", RefShape::NAME)
        .and_then(|b| b.register("Footer", "Page", "spec.footer", RefShape::OPTIONAL_NAME))
        .and_then(|b| b.register("Navigation", "Page", "spec.extraNavigations", RefShape::TYPED_MAP))
        .and_then(|b| b.register("Navigation", "Page", "spec.primaryNavigation", RefShape::OPTIONAL_TYPED))
        .and_then(|b| b.register("ClusterScriptBundle", "Header", "spec.scriptBundle", RefShape::OPTIONAL_TYPED))
        .unwrap()
        .build()
}

fn page(ns: &str, name: &str, spec: serde_json::Value) -> Object {
    Object::new("Page", Some(ns), name).with_spec(spec)
}

fn setup() -> (Arc<MemoryStore>, Indexer) {
    let store = Arc::new(MemoryStore::new());
    let idx = Indexer::new(registry(), store.clone());
    (store, idx)
}

#[tokio::test]
async fn both_dependents_of_a_target_are_returned_once() {
    let (store, idx) = setup();
    store.put(page("site", "dep-a", json!({"header": "target1"})));
    store.put(page("site", "dep-b", json!({"header": "target1", "footer": "f"})));
    store.put(page("site", "unrelated", json!({"header": "other"})));
    let target = store.put(Object::new("Header", Some("site"), "target1"));

    let got = idx.invalidate(&target).await.unwrap();
    assert_eq!(
        got,
        vec![ObjectKey::new("Page", Some("site"), "dep-a"), ObjectKey::new("Page", Some("site"), "dep-b")]
    );
}

#[tokio::test]
async fn same_dependent_through_two_paths_is_deduplicated() {
    let (store, idx) = setup();
    store.put(page(
        "site",
        "home",
        json!({
            "primaryNavigation": {"name": "nav"},
            "extraNavigations": {"a": {"name": "nav"}, "b": {"name": "nav"}}
        }),
    ));
    let nav = store.put(Object::new("Navigation", Some("site"), "nav"));
    assert_eq!(idx.invalidate(&nav).await.unwrap(), vec![ObjectKey::new("Page", Some("site"), "home")]);
}

#[tokio::test]
async fn namespace_is_the_indexing_scope() {
    let (store, idx) = setup();
    store.put(page("team-a", "home", json!({"header": "main"})));
    store.put(page("team-b", "home", json!({"header": "main"})));
    let hdr = store.put(Object::new("Header", Some("team-a"), "main"));
    assert_eq!(idx.invalidate(&hdr).await.unwrap(), vec![ObjectKey::new("Page", Some("team-a"), "home")]);
}

#[tokio::test]
async fn absent_references_never_match() {
    let (store, idx) = setup();
    store.put(page("site", "no-footer", json!({"header": "main", "footer": null})));
    store.put(page("site", "empty-footer", json!({"header": "main", "footer": ""})));
    let footer = store.put(Object::new("Footer", Some("site"), ""));
    assert!(idx.invalidate(&footer).await.unwrap().is_empty());
}

#[tokio::test]
async fn cluster_scoped_target_scans_all_namespaces() {
    let (store, idx) = setup();
    store.put(Object::new("Header", Some("a"), "h1").with_spec(json!({"scriptBundle": {"kind": "ClusterScriptBundle", "name": "core"}})));
    store.put(Object::new("Header", Some("b"), "h2").with_spec(json!({"scriptBundle": {"kind": "ClusterScriptBundle", "name": "core"}})));
    store.put(Object::new("Header", Some("b"), "h3").with_spec(json!({"scriptBundle": {"kind": "ScriptBundle", "name": "core"}})));
    let csb = store.put(Object::new("ClusterScriptBundle", None, "core"));
    assert_eq!(
        idx.invalidate(&csb).await.unwrap(),
        vec![ObjectKey::new("Header", Some("a"), "h1"), ObjectKey::new("Header", Some("b"), "h2")]
    );
}

#[tokio::test]
async fn unregistered_kind_lists_nothing() {
    let (store, idx) = setup();
    store.set_unavailable("Page", true);
    // Pages are never referenced, so the unavailable Page storage is never touched.
    let p = store.put(page("site", "home", json!({})));
    assert!(idx.invalidate(&p).await.unwrap().is_empty());
}
