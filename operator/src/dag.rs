// SPDX-License-Identifier: MIT

//! Dependency-ordered traversal of a blueprint's resource slots.

use crds::BlueprintResource;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::templates::{Inputs, Output};

#[derive(Debug, Error)]
#[error("resources do not form a DAG, unemittable: {leftover:?}")]
pub struct WalkError {
    pub leftover: Vec<String>,
}

/// Names of the upstream slots `resource` consumes.
fn upstream_names(resource: &BlueprintResource) -> Vec<&str> {
    let mut names: Vec<&str> = resource
        .sources
        .iter()
        .chain(&resource.images)
        .chain(&resource.configs)
        .map(|r| r.resource.as_str())
        .collect();
    if let Some(deployment) = &resource.deployment {
        names.push(deployment.resource.as_str());
    }
    names
}

/// Emit resources in topological order. When several orderings are valid the
/// authored list order is preserved. Cycles are a validation concern upstream;
/// here they terminate the walk with the unemittable leftovers.
pub fn walk(resources: &[BlueprintResource]) -> Result<Vec<&BlueprintResource>, WalkError> {
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(resources.len());
    while order.len() < resources.len() {
        let next = resources.iter().find(|r| {
            !emitted.contains(r.name.as_str())
                && upstream_names(r)
                    .iter()
                    .all(|dep| emitted.contains(dep) || !resources.iter().any(|o| o.name == *dep))
        });
        match next {
            Some(resource) => {
                emitted.insert(resource.name.as_str());
                order.push(resource);
            }
            None => {
                return Err(WalkError {
                    leftover: resources
                        .iter()
                        .filter(|r| !emitted.contains(r.name.as_str()))
                        .map(|r| r.name.clone())
                        .collect(),
                })
            }
        }
    }
    Ok(order)
}

/// Assemble a slot's input set from the outputs accumulated so far, keyed by
/// each reference's declared name rather than the producing slot's name.
pub fn inputs_for(resource: &BlueprintResource, outputs: &BTreeMap<String, Output>) -> Inputs {
    let mut inputs = Inputs::default();
    for source in &resource.sources {
        if let Some(Output::Source { url, revision }) = outputs.get(&source.resource) {
            inputs
                .sources
                .insert(source.name.clone(), (url.clone(), revision.clone()));
        }
    }
    for image in &resource.images {
        if let Some(Output::Image(value)) = outputs.get(&image.resource) {
            inputs.images.insert(image.name.clone(), value.clone());
        }
    }
    for config in &resource.configs {
        if let Some(Output::Config(value)) = outputs.get(&config.resource) {
            inputs.configs.insert(config.name.clone(), value.clone());
        }
    }
    if let Some(deployment) = &resource.deployment {
        if let Some(Output::Source { url, revision }) = outputs.get(&deployment.resource) {
            inputs.deployment = Some((url.clone(), revision.clone()));
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{ResourceRef, TemplateRef};
    use serde_json::json;

    fn resource(name: &str, sources: &[(&str, &str)]) -> BlueprintResource {
        BlueprintResource {
            name: name.to_string(),
            template_ref: TemplateRef {
                kind: "ClusterSourceTemplate".to_string(),
                name: format!("{name}-template"),
            },
            params: vec![],
            sources: sources
                .iter()
                .map(|(name, resource)| ResourceRef {
                    name: name.to_string(),
                    resource: resource.to_string(),
                })
                .collect(),
            images: vec![],
            configs: vec![],
            deployment: None,
        }
    }

    #[test]
    fn preserves_authored_order_among_valid_orderings() {
        let resources = vec![
            resource("b", &[]),
            resource("a", &[]),
            resource("c", &[("s", "a")]),
        ];
        let order: Vec<&str> = walk(&resources).unwrap().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn emits_upstreams_before_consumers() {
        let resources = vec![
            resource("img", &[("s", "src")]),
            resource("src", &[]),
        ];
        let order: Vec<&str> = walk(&resources).unwrap().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["src", "img"]);
    }

    #[test]
    fn reports_cycle_leftovers() {
        let resources = vec![
            resource("a", &[("s", "b")]),
            resource("b", &[("s", "a")]),
        ];
        let err = walk(&resources).unwrap_err();
        assert_eq!(err.leftover, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn inputs_are_keyed_by_declared_name() {
        let consumer = resource("img", &[("s", "src")]);
        let outputs = BTreeMap::from([(
            "src".to_string(),
            Output::Source {
                url: json!("https://git/repo"),
                revision: json!("abc"),
            },
        )]);
        let inputs = inputs_for(&consumer, &outputs);
        assert_eq!(
            inputs.sources.get("s"),
            Some(&(json!("https://git/repo"), json!("abc")))
        );
        assert!(!inputs.sources.contains_key("src"));
    }
}
