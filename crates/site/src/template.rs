//! Headers, footers and navigations: template content plus optional references.

use std::sync::Arc;

use tracing::debug;
use trellis_core::{EngineError, EngineResult, KindInfo, Object};
use trellis_reconcile::{Context, Dependencies, Reconciler};
use trellis_resolve::RefField;

use crate::validate::ContentValidator;

/// Validate `spec.template` when present. A template of the wrong type is invalid.
pub(crate) fn check_template(content: &dyn ContentValidator, object: &Object) -> EngineResult<()> {
    let Some(v) = object.spec_field("template") else { return Ok(()) };
    let text = v.as_str().ok_or_else(|| EngineError::Validation("template: must be a string".into()))?;
    content.validate(text).map_err(|e| EngineError::Validation(format!("template: {}", e)))
}

pub struct TemplateReconciler {
    kind: KindInfo,
    refs: &'static [RefField],
    content: Arc<dyn ContentValidator>,
}

impl TemplateReconciler {
    pub fn new(kind: KindInfo, refs: &'static [RefField], content: Arc<dyn ContentValidator>) -> Self {
        Self { kind, refs, content }
    }
}

#[async_trait::async_trait]
impl Reconciler for TemplateReconciler {
    fn kind(&self) -> KindInfo { self.kind }
    fn references(&self) -> &'static [RefField] { self.refs }

    async fn apply(&self, _ctx: &Context, object: &mut Object, deps: &Dependencies) -> EngineResult<()> {
        check_template(self.content.as_ref(), object)?;
        debug!(key = %object.key(), bundle = ?deps.get("scriptBundle").map(|b| b.key()), "template accepted");
        Ok(())
    }
}
