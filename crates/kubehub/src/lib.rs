//! Trellis kubehub: object access against the Kubernetes API.
//!
//! Kinds are addressed by name; each is resolved to an `ApiResource` through discovery once and
//! cached. Watches use the kube runtime watcher, whose restarts replay the full list.

#![forbid(unsafe_code)]

pub mod convert;

pub use convert::{access_error, dynamic_from_object, object_from_dynamic};

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use trellis_api::{AccessError, AccessResult, ChangeEvent, EventType, ListFilter, ObjectAccessor};
use trellis_core::{KindInfo, Object, ObjectKey};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared client for the current kube context.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let c = Client::try_default().await?;
    // A concurrent caller may have won; either client is fine.
    Ok(CLIENT.get_or_init(|| c).clone())
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).filter(&[gvk.group.as_str()]).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// [`ObjectAccessor`] over the cluster for a fixed set of kinds.
pub struct KubeAccessor {
    client: Client,
    kinds: FxHashMap<&'static str, KindInfo>,
    resources: Mutex<FxHashMap<String, (ApiResource, bool)>>,
    /// Restrict lists and watches of namespaced kinds to one namespace.
    namespace: Option<String>,
}

impl KubeAccessor {
    pub fn new(client: Client, kinds: impl IntoIterator<Item = KindInfo>) -> Self {
        Self {
            client,
            kinds: kinds.into_iter().map(|k| (k.kind, k)).collect(),
            resources: Mutex::new(FxHashMap::default()),
            namespace: None,
        }
    }

    pub async fn connect(kinds: impl IntoIterator<Item = KindInfo>) -> Result<Self> {
        Ok(Self::new(get_kube_client().await?, kinds))
    }

    pub fn with_namespace(mut self, ns: Option<String>) -> Self {
        self.namespace = ns;
        self
    }

    async fn resource(&self, kind: &str) -> AccessResult<(ApiResource, bool)> {
        if let Some(hit) = self.resources.lock().unwrap_or_else(|e| e.into_inner()).get(kind) {
            return Ok(hit.clone());
        }
        let info = self.kinds.get(kind).ok_or_else(|| AccessError::Transient(anyhow!("kind {} is not served by this accessor", kind)))?;
        let gvk = parse_gvk_key(&info.gvk_key())?;
        let found = find_api_resource(self.client.clone(), &gvk).await?;
        debug!(gvk = %info.gvk_key(), plural = %found.0.plural, "resolved api resource");
        self.resources.lock().unwrap_or_else(|e| e.into_inner()).insert(kind.to_string(), found.clone());
        Ok(found)
    }

    async fn api(&self, kind: &str, namespace: Option<&str>) -> AccessResult<(Api<DynamicObject>, ApiResource)> {
        let (ar, namespaced) = self.resource(kind).await?;
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    fn fail(&self, verb: &'static str, key: ObjectKey, e: kube::Error) -> AccessError {
        counter!("kube_api_errors_total", 1u64, "verb" => verb);
        access_error(key, e)
    }
}

#[async_trait::async_trait]
impl ObjectAccessor for KubeAccessor {
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> AccessResult<Object> {
        let (api, _) = self.api(kind, namespace).await?;
        let key = ObjectKey::new(kind, namespace, name);
        let d = api.get(name).await.map_err(|e| self.fail("get", key, e))?;
        Ok(object_from_dynamic(kind, &d))
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, filter: Option<&ListFilter>) -> AccessResult<Vec<Object>> {
        let ns = namespace.or(self.namespace.as_deref());
        let (api, _) = self.api(kind, ns).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = filter.and_then(|f| f.selector()) {
            lp = lp.labels(&sel);
        }
        let list = api.list(&lp).await.map_err(|e| self.fail("list", ObjectKey::new(kind, ns, ""), e))?;
        let mut out: Vec<Object> = list.items.iter().map(|d| object_from_dynamic(kind, d)).collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn create(&self, object: &Object) -> AccessResult<Object> {
        let (api, ar) = self.api(&object.kind, object.namespace.as_deref()).await?;
        let mut d = dynamic_from_object(&ar, object)?;
        d.metadata.resource_version = None;
        d.metadata.uid = None;
        let created = api.create(&PostParams::default(), &d).await.map_err(|e| self.fail("create", object.key(), e))?;
        Ok(object_from_dynamic(&object.kind, &created))
    }

    async fn update(&self, object: &Object) -> AccessResult<Object> {
        let (api, ar) = self.api(&object.kind, object.namespace.as_deref()).await?;
        let d = dynamic_from_object(&ar, object)?;
        let updated = api
            .replace(&object.name, &PostParams::default(), &d)
            .await
            .map_err(|e| self.fail("update", object.key(), e))?;
        Ok(object_from_dynamic(&object.kind, &updated))
    }

    async fn update_status(&self, object: &Object) -> AccessResult<Object> {
        let (api, ar) = self.api(&object.kind, object.namespace.as_deref()).await?;
        let d = dynamic_from_object(&ar, object)?;
        let body = serde_json::to_vec(&d).map_err(|e| AccessError::Transient(e.into()))?;
        let updated = api
            .replace_status(&object.name, &PostParams::default(), body)
            .await
            .map_err(|e| self.fail("update_status", object.key(), e))?;
        Ok(object_from_dynamic(&object.kind, &updated))
    }

    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> AccessResult<()> {
        let (api, _) = self.api(kind, namespace).await?;
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| self.fail("delete", ObjectKey::new(kind, namespace, name), e))?;
        Ok(())
    }

    async fn watch(&self, kind: &str) -> AccessResult<BoxStream<'static, AccessResult<ChangeEvent>>> {
        let (api, _) = self.api(kind, self.namespace.as_deref()).await?;
        info!(%kind, ns = ?self.namespace, "watcher started");
        let kind = kind.to_string();
        let stream = watcher::watcher(api, watcher::Config::default()).flat_map(move |ev| {
            let events: Vec<AccessResult<ChangeEvent>> = match ev {
                Ok(Event::Applied(d)) => vec![Ok(change(EventType::Applied, &kind, &d))],
                Ok(Event::Deleted(d)) => vec![Ok(change(EventType::Deleted, &kind, &d))],
                Ok(Event::Restarted(list)) => {
                    debug!(%kind, count = list.len(), "watch restart");
                    list.iter().map(|d| Ok(change(EventType::Applied, &kind, d))).collect()
                }
                Err(e) => vec![Err(AccessError::Transient(anyhow::Error::new(e).context(format!("watching {}", kind))))],
            };
            futures::stream::iter(events)
        });
        Ok(stream.boxed())
    }
}

fn change(event_type: EventType, kind: &str, d: &DynamicObject) -> ChangeEvent {
    ChangeEvent { event_type, object: object_from_dynamic(kind, d) }
}
