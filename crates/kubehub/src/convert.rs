//! Mapping between `DynamicObject` and engine objects, and between kube and accessor errors.

use anyhow::anyhow;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject};
use serde_json::{Map, Value};
use tracing::warn;
use trellis_api::AccessError;
use trellis_core::{Object, ObjectKey, Status};

/// Kinds that keep their payload at the top level instead of under `spec`.
const TOP_LEVEL_KINDS: &[&str] = &["ConfigMap", "Secret"];

fn top_level(kind: &str) -> bool { TOP_LEVEL_KINDS.contains(&kind) }

pub fn object_from_dynamic(kind: &str, d: &DynamicObject) -> Object {
    let meta = &d.metadata;
    let mut o = Object::new(kind, meta.namespace.as_deref(), meta.name.clone().unwrap_or_default());
    o.uid = meta.uid.clone();
    o.generation = meta.generation.unwrap_or(0);
    o.resource_version = meta.resource_version.clone();
    o.labels = meta.labels.clone().unwrap_or_default();
    o.finalizers = meta.finalizers.clone().unwrap_or_default();
    o.deletion_timestamp = meta.deletion_timestamp.as_ref().map(|t| t.0);
    o.spec = if top_level(kind) {
        match &d.data {
            Value::Object(m) => Value::Object(m.iter().filter(|(k, _)| k.as_str() != "status").map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Value::Null,
        }
    } else {
        d.data.get("spec").cloned().unwrap_or(Value::Null)
    };
    if let Some(st) = d.data.get("status").filter(|v| !v.is_null()) {
        match serde_json::from_value::<Status>(st.clone()) {
            Ok(s) => o.status = s,
            // Foreign status shapes are treated as "never reconciled".
            Err(e) => warn!(key = %o.key(), error = %e, "unreadable status ignored"),
        }
    }
    o
}

pub fn dynamic_from_object(ar: &ApiResource, o: &Object) -> anyhow::Result<DynamicObject> {
    let mut d = DynamicObject::new(&o.name, ar);
    d.metadata.namespace = o.namespace.clone();
    d.metadata.uid = o.uid.clone();
    d.metadata.generation = (o.generation > 0).then_some(o.generation);
    d.metadata.resource_version = o.resource_version.clone();
    d.metadata.labels = (!o.labels.is_empty()).then(|| o.labels.clone());
    d.metadata.finalizers = Some(o.finalizers.clone());
    d.metadata.deletion_timestamp = o.deletion_timestamp.map(Time);
    let status = serde_json::to_value(&o.status)?;
    d.data = if top_level(&o.kind) {
        match &o.spec {
            Value::Object(m) => Value::Object(m.clone()),
            Value::Null => Value::Object(Map::new()),
            other => return Err(anyhow!("{} payload must be an object, got {}", o.kind, other)),
        }
    } else {
        serde_json::json!({ "spec": o.spec, "status": status })
    };
    Ok(d)
}

/// 404 and 409 keep their meaning; everything else is retryable noise.
pub fn access_error(key: ObjectKey, e: kube::Error) -> AccessError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => AccessError::NotFound(key),
        kube::Error::Api(ae) if ae.code == 409 => AccessError::Conflict(key),
        other => AccessError::Transient(anyhow::Error::new(other).context(format!("kube request for {}", key))),
    }
}
