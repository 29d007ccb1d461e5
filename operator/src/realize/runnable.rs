// SPDX-License-Identifier: MIT

use crds::Runnable;
use kube::api::ListParams;
use kube::core::DynamicObject;
use kube::{Client, Resource, ResourceExt};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{apply_stamped, dynamic_api};
use crate::errors::RealizeError;
use crate::eval::Evaluator;
use crate::repository::Repository;
use crate::stamp::Stamper;

pub struct RunnableRealization {
    pub stamped: Option<DynamicObject>,
    pub outputs: BTreeMap<String, Value>,
}

/// One-shot realization: stamp the run template with the runnable's inputs,
/// then read outputs back from the most recently successful prior stamping.
pub async fn realize_runnable(
    repo: &Repository,
    stamp_client: &Client,
    evaluator: &dyn Evaluator,
    runnable: &Runnable,
) -> Result<RunnableRealization, RealizeError> {
    let name = crate::name_or_default(&runnable.metadata);
    let namespace = runnable.metadata.namespace.clone().unwrap_or_default();

    let run_template = repo
        .run_template(&runnable.spec.run_template_ref.name)
        .await
        .map_err(|source| RealizeError::GetRunTemplate {
            name: runnable.spec.run_template_ref.name.clone(),
            source,
        })?;

    let labels = BTreeMap::from([
        ("carto.run/runnable-name".to_string(), name.clone()),
        (
            "carto.run/run-template-name".to_string(),
            crate::name_or_default(&run_template.metadata),
        ),
    ]);
    let context = runnable_context(runnable)?;
    let owner = owner_reference(runnable)?;
    let stamper = Stamper::new(context, owner, &namespace, labels);
    let stamped = stamper
        .stamp(&run_template.spec.template)
        .map_err(|source| RealizeError::Stamp {
            resource: name.clone(),
            source,
        })?;

    let live = apply_stamped(stamp_client, &namespace, &stamped)
        .await
        .map_err(|source| RealizeError::ApplyStampedObject {
            resource: name.clone(),
            namespace: namespace.clone(),
            name: stamped.metadata.name.clone().unwrap_or_default(),
            source,
        })?;

    let api = dynamic_api(stamp_client, &namespace, &live).map_err(|source| {
        RealizeError::ListCreatedObjects {
            runnable: name.clone(),
            source,
        }
    })?;
    let created = api
        .list(&ListParams::default().labels(&format!("carto.run/runnable-name={name}")))
        .await
        .map_err(|source| RealizeError::ListCreatedObjects {
            runnable: name.clone(),
            source,
        })?;

    let mut candidates: Vec<Value> = created
        .items
        .iter()
        .filter_map(|o| serde_json::to_value(o).ok())
        .collect();
    if let Some(selector) = &runnable.spec.selector {
        candidates.retain(|c| selector_matches(&selector.match_labels, c));
        if candidates.is_empty() {
            return Err(RealizeError::ResolveSelector {
                runnable: name.clone(),
            });
        }
    }

    let outputs = match select_successful(&candidates) {
        Some(chosen) => extract_outputs(evaluator, &run_template.spec.outputs, chosen).map_err(
            |source| RealizeError::RetrieveOutput {
                resource: name.clone(),
                object: live.name_any(),
                source,
            },
        )?,
        None => BTreeMap::new(),
    };

    Ok(RunnableRealization {
        stamped: Some(live),
        outputs,
    })
}

fn runnable_context(runnable: &Runnable) -> Result<Value, RealizeError> {
    let mut root = Map::new();
    root.insert(
        "runnable".to_string(),
        serde_json::to_value(runnable).map_err(invalid_context)?,
    );
    root.insert(
        "inputs".to_string(),
        Value::Object(runnable.spec.inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    Ok(Value::Object(root))
}

fn invalid_context(e: serde_json::Error) -> RealizeError {
    RealizeError::Stamp {
        resource: "runnable".to_string(),
        source: crate::stamp::StampError::InvalidObject(e.to_string()),
    }
}

fn owner_reference(
    runnable: &Runnable,
) -> Result<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference, RealizeError> {
    let missing = |field: &str| RealizeError::Stamp {
        resource: "runnable".to_string(),
        source: crate::stamp::StampError::InvalidObject(format!("runnable has no {field}")),
    };
    Ok(k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
        api_version: Runnable::api_version(&()).to_string(),
        kind: Runnable::kind(&()).to_string(),
        name: runnable.metadata.name.clone().ok_or_else(|| missing("name"))?,
        uid: runnable.metadata.uid.clone().ok_or_else(|| missing("uid"))?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

fn selector_matches(labels: &BTreeMap<String, String>, object: &Value) -> bool {
    labels.iter().all(|(key, value)| {
        object["metadata"]["labels"]
            .get(key.as_str())
            .and_then(Value::as_str)
            .is_some_and(|v| v == value)
    })
}

/// Prefer the newest object whose `Succeeded` condition is `True`; when no
/// object reports one, fall back to the newest by creationTimestamp.
pub fn select_successful(candidates: &[Value]) -> Option<&Value> {
    fn newest(values: Vec<&Value>) -> Option<&Value> {
        values.into_iter().max_by_key(|c| {
            c["metadata"]["creationTimestamp"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
    }
    let succeeded: Vec<&Value> = candidates.iter().filter(|c| has_succeeded(c)).collect();
    if !succeeded.is_empty() {
        return newest(succeeded);
    }
    newest(candidates.iter().collect())
}

fn has_succeeded(object: &Value) -> bool {
    object["status"]["conditions"]
        .as_array()
        .into_iter()
        .flatten()
        .any(|c| {
            c["type"].as_str() == Some("Succeeded") && c["status"].as_str() == Some("True")
        })
}

fn extract_outputs(
    evaluator: &dyn Evaluator,
    declared: &BTreeMap<String, String>,
    object: &Value,
) -> Result<BTreeMap<String, Value>, crate::templates::ExtractError> {
    let mut outputs = BTreeMap::new();
    for (name, path) in declared {
        let value = evaluator.evaluate(path, object).map_err(|e| {
            crate::templates::ExtractError::MissingValue {
                path: path.clone(),
                problem: e.problem,
            }
        })?;
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn succeeded_object_beats_newer_unfinished_one() {
        let succeeded = json!({
            "metadata": {"name": "run-a", "creationTimestamp": "2026-01-01T00:00:00Z"},
            "status": {"conditions": [{"type": "Succeeded", "status": "True"}]},
        });
        let newer = json!({
            "metadata": {"name": "run-b", "creationTimestamp": "2026-01-02T00:00:00Z"},
            "status": {},
        });
        let candidates = vec![succeeded.clone(), newer];
        let chosen = select_successful(&candidates).unwrap();
        assert_eq!(chosen["metadata"]["name"], json!("run-a"));
    }

    #[test]
    fn newest_wins_when_none_succeeded() {
        let older = json!({
            "metadata": {"name": "run-a", "creationTimestamp": "2026-01-01T00:00:00Z"},
        });
        let newer = json!({
            "metadata": {"name": "run-b", "creationTimestamp": "2026-01-02T00:00:00Z"},
        });
        let candidates = vec![older, newer];
        let chosen = select_successful(&candidates).unwrap();
        assert_eq!(chosen["metadata"]["name"], json!("run-b"));
    }

    #[test]
    fn newest_succeeded_wins_among_several() {
        let candidates = vec![
            json!({
                "metadata": {"name": "run-a", "creationTimestamp": "2026-01-01T00:00:00Z"},
                "status": {"conditions": [{"type": "Succeeded", "status": "True"}]},
            }),
            json!({
                "metadata": {"name": "run-b", "creationTimestamp": "2026-01-03T00:00:00Z"},
                "status": {"conditions": [{"type": "Succeeded", "status": "False"}]},
            }),
            json!({
                "metadata": {"name": "run-c", "creationTimestamp": "2026-01-02T00:00:00Z"},
                "status": {"conditions": [{"type": "Succeeded", "status": "True"}]},
            }),
        ];
        let chosen = select_successful(&candidates).unwrap();
        assert_eq!(chosen["metadata"]["name"], json!("run-c"));
    }
}
