// SPDX-License-Identifier: MIT

//! Realization: stamping a blueprint's resource slots into live objects and
//! feeding outputs of upstream slots into downstream slots.

mod chain;
mod runnable;

pub use chain::{Blueprint, BlueprintKind, ChainRealizer, RealizedSlot};
pub use runnable::{realize_runnable, RunnableRealization};

use crds::{BlueprintParam, Deliverable, Param, Workload};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The intent-side half of a stamp: identity, ownership and params.
pub struct IntentContext {
    pub key: &'static str,
    pub kind_label: &'static str,
    pub blueprint_label: &'static str,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub object: Value,
    pub params: Vec<Param>,
}

impl IntentContext {
    pub fn workload(workload: &Workload) -> anyhow::Result<Self> {
        Ok(Self {
            key: "workload",
            kind_label: "carto.run/workload-name",
            blueprint_label: "carto.run/supply-chain-name",
            api_version: Workload::api_version(&()).to_string(),
            kind: Workload::kind(&()).to_string(),
            name: required(workload.metadata.name.as_deref(), "name")?,
            namespace: required(workload.metadata.namespace.as_deref(), "namespace")?,
            uid: required(workload.metadata.uid.as_deref(), "uid")?,
            object: serde_json::to_value(workload)?,
            params: workload.spec.params.clone(),
        })
    }

    pub fn deliverable(deliverable: &Deliverable) -> anyhow::Result<Self> {
        Ok(Self {
            key: "deliverable",
            kind_label: "carto.run/deliverable-name",
            blueprint_label: "carto.run/delivery-name",
            api_version: Deliverable::api_version(&()).to_string(),
            kind: Deliverable::kind(&()).to_string(),
            name: required(deliverable.metadata.name.as_deref(), "name")?,
            namespace: required(deliverable.metadata.namespace.as_deref(), "namespace")?,
            uid: required(deliverable.metadata.uid.as_deref(), "uid")?,
            object: serde_json::to_value(deliverable)?,
            params: deliverable.spec.params.clone(),
        })
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Identity labels for a stamped object: intent, blueprint, slot and
    /// template.
    pub fn labels(
        &self,
        blueprint: &str,
        resource: &str,
        template: &str,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.kind_label.to_string(), self.name.clone()),
            (self.blueprint_label.to_string(), blueprint.to_string()),
            ("carto.run/resource-name".to_string(), resource.to_string()),
            (
                "carto.run/cluster-template-name".to_string(),
                template.to_string(),
            ),
        ])
    }
}

fn required(value: Option<&str>, field: &str) -> anyhow::Result<String> {
    value
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("intent object has no {field}"))
}

/// Merge params: template defaults, then blueprint resource params, then the
/// intent's own. A blueprint param with `value` is authoritative and the
/// intent cannot override it.
pub fn merge_params(
    template_defaults: &[BlueprintParam],
    resource_params: &[BlueprintParam],
    intent_params: &[Param],
) -> BTreeMap<String, Value> {
    let mut merged = BTreeMap::new();
    let mut authoritative = BTreeSet::new();
    for param in template_defaults.iter().chain(resource_params) {
        if let Some(value) = &param.value {
            merged.insert(param.name.clone(), value.clone());
            authoritative.insert(param.name.clone());
        } else if let Some(default) = &param.default {
            merged.insert(param.name.clone(), default.clone());
            authoritative.remove(&param.name);
        }
    }
    for param in intent_params {
        if !authoritative.contains(&param.name) {
            merged.insert(param.name.clone(), param.value.clone());
        }
    }
    merged
}

/// Apply a stamped object with the impersonated client. Named objects go
/// through server-side apply. A generateName object converges on the prior
/// stamping for its slot, found by owner + identity labels; only when none
/// exists is a fresh object created. Returns the live object as observed by
/// the API server.
pub async fn apply_stamped(
    client: &Client,
    namespace: &str,
    object: &DynamicObject,
) -> Result<DynamicObject, kube::Error> {
    let api = dynamic_api(client, namespace, object)?;
    let params = PatchParams::apply("cartographer").force();
    if let Some(name) = &object.metadata.name {
        return api.patch(name, &params, &Patch::Apply(object)).await;
    }

    let selector = label_selector(object);
    if !selector.is_empty() {
        let existing = api.list(&ListParams::default().labels(&selector)).await?;
        if let Some(name) = prior_stamping_name(&existing.items, object) {
            let mut replacement = object.clone();
            replacement.metadata.name = Some(name.clone());
            replacement.metadata.generate_name = None;
            return api.patch(&name, &params, &Patch::Apply(&replacement)).await;
        }
    }
    api.create(&PostParams::default(), object).await
}

fn label_selector(object: &DynamicObject) -> String {
    object
        .metadata
        .labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// The name of the authoritative prior stamping for this slot: owned by the
/// same intent, newest creationTimestamp when several linger.
fn prior_stamping_name(candidates: &[DynamicObject], object: &DynamicObject) -> Option<String> {
    let owner_uids: BTreeSet<&str> = object
        .owner_references()
        .iter()
        .map(|o| o.uid.as_str())
        .collect();
    candidates
        .iter()
        .filter(|c| {
            c.owner_references()
                .iter()
                .any(|o| owner_uids.contains(o.uid.as_str()))
        })
        .max_by_key(|c| c.metadata.creation_timestamp.clone())
        .and_then(|c| c.metadata.name.clone())
}

pub fn dynamic_api(
    client: &Client,
    namespace: &str,
    object: &DynamicObject,
) -> Result<Api<DynamicObject>, kube::Error> {
    let types = object.types.clone().unwrap_or_default();
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    let gvk = GroupVersionKind::gvk(&group, &version, &types.kind);
    Ok(Api::namespaced_with(
        client.clone(),
        namespace,
        &ApiResource::from_gvk(&gvk),
    ))
}

/// Reference recorded on the intent's status for a stamped object.
pub fn stamped_ref(object: &DynamicObject) -> crds::StampedRef {
    let types = object.types.clone().unwrap_or_default();
    crds::StampedRef {
        api_version: types.api_version,
        kind: types.kind,
        name: object.name_any(),
        namespace: object.metadata.namespace.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blueprint_param(name: &str, value: Option<Value>, default: Option<Value>) -> BlueprintParam {
        BlueprintParam {
            name: name.to_string(),
            value,
            default,
        }
    }

    #[test]
    fn intent_params_override_defaults_but_not_values() {
        let template = vec![blueprint_param("registry", None, Some(json!("docker.io")))];
        let resource = vec![
            blueprint_param("pinned", Some(json!("always")), None),
            blueprint_param("replicas", None, Some(json!(1))),
        ];
        let intent = vec![
            Param {
                name: "pinned".to_string(),
                value: json!("never"),
            },
            Param {
                name: "replicas".to_string(),
                value: json!(3),
            },
        ];
        let merged = merge_params(&template, &resource, &intent);
        assert_eq!(merged["registry"], json!("docker.io"));
        assert_eq!(merged["pinned"], json!("always"));
        assert_eq!(merged["replicas"], json!(3));
    }

    #[test]
    fn resource_params_shadow_template_defaults() {
        let template = vec![blueprint_param("registry", None, Some(json!("docker.io")))];
        let resource = vec![blueprint_param("registry", None, Some(json!("ghcr.io")))];
        let merged = merge_params(&template, &resource, &[]);
        assert_eq!(merged["registry"], json!("ghcr.io"));
    }

    fn stamped(name: Option<&str>, owner_uid: &str, created: &str) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("example.dev", "v1", "Run"));
        let mut object = DynamicObject::new(name.unwrap_or_default(), &resource).within("dev");
        object.metadata.name = name.map(str::to_string);
        if name.is_none() {
            object.metadata.generate_name = Some("run-".to_string());
        }
        object.metadata.labels = Some(std::collections::BTreeMap::from([(
            "carto.run/resource-name".to_string(),
            "src".to_string(),
        )]));
        object.metadata.owner_references =
            Some(vec![OwnerReference {
                api_version: "carto.run/v1alpha1".to_string(),
                kind: "Workload".to_string(),
                name: "w".to_string(),
                uid: owner_uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]);
        if !created.is_empty() {
            let parsed = k8s_openapi::chrono::DateTime::parse_from_rfc3339(created)
                .unwrap()
                .with_timezone(&k8s_openapi::chrono::Utc);
            object.metadata.creation_timestamp =
                Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(parsed));
        }
        object
    }

    #[test]
    fn prior_stamping_requires_a_matching_owner() {
        let fresh = stamped(None, "uid-1", "");
        let ours = stamped(Some("run-abc"), "uid-1", "2026-01-01T00:00:00Z");
        let other = stamped(Some("run-xyz"), "uid-2", "2026-01-02T00:00:00Z");
        let name = prior_stamping_name(&[other.clone(), ours], &fresh);
        assert_eq!(name.as_deref(), Some("run-abc"));
        assert_eq!(prior_stamping_name(&[other], &fresh), None);
    }

    #[test]
    fn newest_prior_stamping_wins() {
        let fresh = stamped(None, "uid-1", "");
        let older = stamped(Some("run-old"), "uid-1", "2026-01-01T00:00:00Z");
        let newer = stamped(Some("run-new"), "uid-1", "2026-01-03T00:00:00Z");
        let name = prior_stamping_name(&[older, newer], &fresh);
        assert_eq!(name.as_deref(), Some("run-new"));
    }

    #[test]
    fn label_selector_covers_the_identity_labels() {
        let fresh = stamped(None, "uid-1", "");
        assert_eq!(label_selector(&fresh), "carto.run/resource-name=src");
    }
}
