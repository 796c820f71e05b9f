//! Multi-document YAML manifests loaded into engine objects.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use trellis_core::Object;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    api_version: String,
    kind: String,
    metadata: Metadata,
    #[serde(default)]
    spec: serde_json::Value,
    /// ConfigMap-style payload.
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// Parse every non-empty document. Namespaced kinds without a namespace land in `default_ns`.
pub fn parse(text: &str, default_ns: &str) -> Result<Vec<Object>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", i + 1))?;
        if value.is_null() {
            continue;
        }
        let m: Manifest = serde_yaml::from_value(value).with_context(|| format!("document {}", i + 1))?;
        let info = trellis_site::kind_info(&m.kind).ok_or_else(|| anyhow!("document {}: unknown kind {}", i + 1, m.kind))?;
        if !m.api_version.is_empty() && m.api_version != info.api_version() {
            return Err(anyhow!("document {}: {} is served as {}, not {}", i + 1, m.kind, info.api_version(), m.api_version));
        }
        let ns = info.namespaced.then(|| m.metadata.namespace.as_deref().unwrap_or(default_ns).to_string());
        let spec = match m.data {
            Some(data) => serde_json::json!({ "data": data }),
            None => m.spec,
        };
        let mut o = Object::new(m.kind, ns.as_deref(), m.metadata.name).with_spec(spec);
        o.labels = m.metadata.labels;
        out.push(o);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = r#"
apiVersion: trellis.dev/v1alpha1
kind: Page
metadata:
  name: page1
spec:
  header: Header1
  extraNavigations:
    top: { name: nav }
---
apiVersion: trellis.dev/v1alpha1
kind: ClusterScriptBundle
metadata:
  name: core
  namespace: ignored
spec:
  packages: [react]
---
"#;

    #[test]
    fn parses_documents_and_applies_scope() {
        let objs = parse(SITE, "default").unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].namespace.as_deref(), Some("default"));
        assert_eq!(objs[0].spec["extraNavigations"]["top"]["name"], "nav");
        assert_eq!(objs[1].namespace, None);
    }

    #[test]
    fn rejects_unknown_kinds_and_versions() {
        assert!(parse("kind: Widget\nmetadata: {name: w}\n", "default").is_err());
        assert!(parse("apiVersion: v2\nkind: Page\nmetadata: {name: p}\n", "default").is_err());
    }
}
