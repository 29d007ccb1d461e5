// SPDX-License-Identifier: MIT

//! Stamping: interpolating a template body with an input context and shaping
//! the result into an applyable object carrying ownership and identity.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::eval::{Evaluator, PathEvaluator};
use crate::templates::Inputs;

#[derive(Debug, Error)]
pub enum StampError {
    #[error("template has no stampable body")]
    MissingBody,
    #[error("interpolate [{expression}]: {problem}")]
    Interpolation { expression: String, problem: String },
    #[error("stamped object is not a valid object: {0}")]
    InvalidObject(String),
    #[error("stamped object lacks apiVersion or kind")]
    MissingTypeMeta,
    #[error("stamped object needs metadata.name or metadata.generateName")]
    MissingName,
}

/// Everything a stamp needs besides the template body: the interpolation
/// context, the owning intent and the identity labels.
pub struct Stamper {
    context: Value,
    owner: OwnerReference,
    namespace: String,
    labels: BTreeMap<String, String>,
}

impl Stamper {
    pub fn new(
        context: Value,
        owner: OwnerReference,
        namespace: &str,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            context,
            owner,
            namespace: namespace.to_string(),
            labels,
        }
    }

    pub fn stamp(&self, body: &Value) -> Result<DynamicObject, StampError> {
        let interpolated = self.interpolate(body)?;
        let Value::Object(mut root) = interpolated else {
            return Err(StampError::InvalidObject("body is not a map".to_string()));
        };
        let has_type_meta = root.get("apiVersion").is_some_and(Value::is_string)
            && root.get("kind").is_some_and(Value::is_string);
        if !has_type_meta {
            return Err(StampError::MissingTypeMeta);
        }

        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(metadata) = metadata else {
            return Err(StampError::InvalidObject("metadata is not a map".to_string()));
        };
        let named = metadata.get("name").is_some_and(Value::is_string)
            || metadata.get("generateName").is_some_and(Value::is_string);
        if !named {
            return Err(StampError::MissingName);
        }
        metadata.insert("namespace".to_string(), Value::String(self.namespace.clone()));

        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(labels) = labels {
            for (k, v) in &self.labels {
                labels.insert(k.clone(), Value::String(v.clone()));
            }
        }
        metadata.insert(
            "ownerReferences".to_string(),
            serde_json::to_value(vec![self.owner.clone()])
                .map_err(|e| StampError::InvalidObject(e.to_string()))?,
        );

        serde_json::from_value(Value::Object(root))
            .map_err(|e| StampError::InvalidObject(e.to_string()))
    }

    fn interpolate(&self, value: &Value) -> Result<Value, StampError> {
        match value {
            Value::String(s) => self.interpolate_string(s),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.interpolate(v))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    let key = match self.interpolate_string(k)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(key, self.interpolate(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// A string that is exactly one `$(expr)$` marker keeps the resolved
    /// value's type; embedded markers interpolate into the string.
    fn interpolate_string(&self, s: &str) -> Result<Value, StampError> {
        let trimmed = s.trim();
        if let Some(expr) = whole_marker(trimmed) {
            return self.resolve(expr);
        }
        let mut out = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("$(") {
            let Some(end) = rest[start..].find(")$") else {
                break;
            };
            out.push_str(&rest[..start]);
            let expr = &rest[start + 2..start + end];
            match self.resolve(expr)? {
                Value::String(s) => out.push_str(&s),
                other => out.push_str(&other.to_string()),
            }
            rest = &rest[start + end + 2..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn resolve(&self, expression: &str) -> Result<Value, StampError> {
        PathEvaluator
            .evaluate(expression, &self.context)
            .map_err(|e| StampError::Interpolation {
                expression: expression.to_string(),
                problem: e.problem,
            })
    }
}

fn whole_marker(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("$(")?.strip_suffix(")$")?;
    // A single marker only; `$(a)$-$(b)$` falls through to string mode.
    if inner.contains(")$") {
        return None;
    }
    Some(inner)
}

/// Assemble the interpolation context for a stamp: the whole intent object
/// under its kind key, the merged params and the upstream outputs. When
/// exactly one input of a category exists, the singular alias also resolves.
pub fn stamp_context(
    intent_key: &str,
    intent: Value,
    params: &BTreeMap<String, Value>,
    inputs: &Inputs,
) -> Value {
    let mut root = Map::new();
    root.insert(intent_key.to_string(), intent);
    root.insert(
        "params".to_string(),
        Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );

    let sources: Map<String, Value> = inputs
        .sources
        .iter()
        .map(|(name, (url, revision))| {
            (
                name.clone(),
                serde_json::json!({"url": url, "revision": revision}),
            )
        })
        .collect();
    if sources.len() == 1 {
        root.insert(
            "source".to_string(),
            sources.values().next().cloned().unwrap_or_default(),
        );
    }
    root.insert("sources".to_string(), Value::Object(sources));

    let images: Map<String, Value> = inputs
        .images
        .iter()
        .map(|(name, image)| (name.clone(), serde_json::json!({"image": image})))
        .collect();
    if images.len() == 1 {
        root.insert(
            "image".to_string(),
            inputs.images.values().next().cloned().unwrap_or_default(),
        );
    }
    root.insert("images".to_string(), Value::Object(images));

    let configs: Map<String, Value> = inputs
        .configs
        .iter()
        .map(|(name, config)| (name.clone(), serde_json::json!({"config": config})))
        .collect();
    if configs.len() == 1 {
        root.insert(
            "config".to_string(),
            inputs.configs.values().next().cloned().unwrap_or_default(),
        );
    }
    root.insert("configs".to_string(), Value::Object(configs));

    if let Some((url, revision)) = &inputs.deployment {
        root.insert(
            "deployment".to_string(),
            serde_json::json!({"url": url, "revision": revision}),
        );
    }

    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "carto.run/v1alpha1".to_string(),
            kind: "Workload".to_string(),
            name: "my-workload".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn stamper(context: Value) -> Stamper {
        Stamper::new(
            context,
            owner(),
            "dev",
            BTreeMap::from([(
                "carto.run/workload-name".to_string(),
                "my-workload".to_string(),
            )]),
        )
    }

    #[test]
    fn stamps_with_identity_and_ownership() {
        let context = json!({"workload": {"spec": {"source": {"git": {"url": "https://git/repo"}}}}});
        let body = json!({
            "apiVersion": "source.toolkit.fluxcd.io/v1",
            "kind": "GitRepository",
            "metadata": {"name": "repo"},
            "spec": {"url": "$(workload.spec.source.git.url)$"},
        });
        let obj = stamper(context).stamp(&body).unwrap();
        assert_eq!(obj.metadata.name.as_deref(), Some("repo"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("dev"));
        assert_eq!(
            obj.metadata.labels.as_ref().unwrap()["carto.run/workload-name"],
            "my-workload"
        );
        let owner_refs = obj.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owner_refs[0].name, "my-workload");
        assert_eq!(owner_refs[0].controller, Some(true));
        assert_eq!(obj.data["spec"]["url"], json!("https://git/repo"));
    }

    #[test]
    fn whole_marker_preserves_value_type() {
        let context = json!({"params": {"replicas": 3}});
        let body = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"generateName": "app-"},
            "spec": {"replicas": "$(params.replicas)$", "name": "app-$(params.replicas)$"},
        });
        let obj = stamper(context).stamp(&body).unwrap();
        assert_eq!(obj.data["spec"]["replicas"], json!(3));
        assert_eq!(obj.data["spec"]["name"], json!("app-3"));
    }

    #[test]
    fn rejects_bodies_without_identity() {
        let context = json!({});
        let no_kind = json!({"apiVersion": "v1", "metadata": {"name": "x"}});
        assert!(matches!(
            stamper(context.clone()).stamp(&no_kind),
            Err(StampError::MissingTypeMeta)
        ));
        let no_name = json!({"apiVersion": "v1", "kind": "ConfigMap"});
        assert!(matches!(
            stamper(context).stamp(&no_name),
            Err(StampError::MissingName)
        ));
    }

    #[test]
    fn singular_alias_resolves_for_single_inputs() {
        let inputs = Inputs {
            sources: BTreeMap::from([(
                "s".to_string(),
                (json!("https://git/repo"), json!("abc")),
            )]),
            ..Default::default()
        };
        let context = stamp_context("workload", json!({}), &BTreeMap::new(), &inputs);
        assert_eq!(
            PathEvaluator.evaluate("source.url", &context).unwrap(),
            json!("https://git/repo")
        );
        assert_eq!(
            PathEvaluator.evaluate("sources.s.revision", &context).unwrap(),
            json!("abc")
        );
    }

    #[test]
    fn missing_interpolation_value_names_the_expression() {
        let context = json!({"params": {}});
        let body = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "x"},
            "data": {"v": "$(params.absent)$"},
        });
        let err = stamper(context).stamp(&body).unwrap_err();
        match err {
            StampError::Interpolation { expression, .. } => assert_eq!(expression, "params.absent"),
            other => panic!("unexpected error {other}"),
        }
    }
}
