//! Pages: resolve header, footer and navigations, then publish a `page-<name>` ConfigMap.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};
use trellis_api::AccessError;
use trellis_core::{EngineResult, KindInfo, Object};
use trellis_reconcile::{Context, Dependencies, Reconciler};
use trellis_resolve::RefField;

use crate::template::check_template;
use crate::validate::ContentValidator;
use crate::{CONFIG_MAP, PAGE, PAGE_REFS};

pub const FINALIZER: &str = "trellis.dev/rendered-page";
/// Label tying a derived ConfigMap to its page.
pub const PAGE_LABEL: &str = "trellis.dev/page";

pub fn rendered_name(page: &str) -> String { format!("page-{}", page) }

pub struct PageReconciler {
    content: Arc<dyn ContentValidator>,
}

impl PageReconciler {
    pub fn new(content: Arc<dyn ContentValidator>) -> Self { Self { content } }
}

/// Desired ConfigMap for a page with its resolved dependencies.
pub fn rendered(page: &Object, deps: &Dependencies) -> Object {
    let name_of = |field: &str| deps.get(field).map(|o| o.name.clone()).unwrap_or_default();
    let navs: Vec<&str> = deps.all("extraNavigations").iter().map(|o| o.name.as_str()).collect();
    let mut data = BTreeMap::new();
    data.insert("page", page.name.clone());
    data.insert("generation", page.generation.to_string());
    data.insert("header", name_of("header"));
    data.insert("footer", name_of("footer"));
    data.insert("navigations", navs.join(","));
    if let Some(t) = page.spec_str("template") {
        data.insert("template", t.to_string());
    }
    let mut cm = Object::new(CONFIG_MAP.kind, page.namespace.as_deref(), rendered_name(&page.name)).with_spec(json!({ "data": data }));
    cm.labels.insert(PAGE_LABEL.to_string(), page.name.clone());
    cm
}

#[async_trait::async_trait]
impl Reconciler for PageReconciler {
    fn kind(&self) -> KindInfo { PAGE }
    fn references(&self) -> &'static [RefField] { &PAGE_REFS }
    fn finalizer(&self) -> Option<&'static str> { Some(FINALIZER) }

    async fn apply(&self, ctx: &Context, object: &mut Object, deps: &Dependencies) -> EngineResult<()> {
        check_template(self.content.as_ref(), object)?;
        let desired = rendered(object, deps);
        let ns = desired.namespace.as_deref();
        match ctx.accessor.get_opt(CONFIG_MAP.kind, ns, &desired.name).await? {
            None => {
                ctx.accessor.create(&desired).await?;
                info!(page = %object.key(), configmap = %desired.name, "rendered page created");
            }
            Some(cur) if cur.spec != desired.spec || cur.labels != desired.labels => {
                let mut next = desired;
                next.resource_version = cur.resource_version;
                ctx.accessor.update(&next).await?;
                debug!(page = %object.key(), "rendered page updated");
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn cleanup(&self, ctx: &Context, object: &Object) -> EngineResult<()> {
        let name = rendered_name(&object.name);
        match ctx.accessor.delete(CONFIG_MAP.kind, object.namespace.as_deref(), &name).await {
            Ok(()) | Err(AccessError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
