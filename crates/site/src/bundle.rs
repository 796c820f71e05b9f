//! Script bundles, namespaced and cluster-wide: a list of packages checked against the registry rules.

use std::sync::Arc;

use trellis_core::{EngineError, EngineResult, KindInfo, Object};
use trellis_reconcile::{Context, Dependencies, Reconciler};

use crate::validate::RegistryValidator;

pub struct BundleReconciler {
    kind: KindInfo,
    registry: Arc<dyn RegistryValidator>,
}

impl BundleReconciler {
    pub fn new(kind: KindInfo, registry: Arc<dyn RegistryValidator>) -> Self { Self { kind, registry } }
}

#[async_trait::async_trait]
impl Reconciler for BundleReconciler {
    fn kind(&self) -> KindInfo { self.kind }

    async fn apply(&self, _ctx: &Context, object: &mut Object, _deps: &Dependencies) -> EngineResult<()> {
        let Some(v) = object.spec_field("packages") else { return Ok(()) };
        let list = v.as_array().ok_or_else(|| EngineError::Validation("packages: must be a list".into()))?;
        for (i, p) in list.iter().enumerate() {
            let name = p.as_str().ok_or_else(|| EngineError::Validation(format!("packages[{}]: must be a string", i)))?;
            self.registry
                .validate(name)
                .await
                .map_err(|e| EngineError::Validation(format!("packages[{}]: {}", i, e)))?;
        }
        Ok(())
    }
}
