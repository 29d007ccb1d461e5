// SPDX-License-Identifier: MIT

//! Typed wrappers around the five stampable template kinds.
//!
//! Each variant knows its template body, its default params and how to read
//! typed outputs back out of the observed stamped object. Dispatch over the
//! kind is a closed match.

use crds::{
    BlueprintParam, ClusterConfigTemplate, ClusterDeploymentTemplate, ClusterImageTemplate,
    ClusterSourceTemplate, ClusterTemplate, CompletionEvidence,
};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::eval::Evaluator;

/// Output categories a slot can feed downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Source { url: Value, revision: Value },
    Image(Value),
    Config(Value),
    None,
}

impl Output {
    /// Flat representation recorded on the intent's status.
    pub fn to_status_map(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        match self {
            Output::Source { url, revision } => {
                map.insert("url".to_string(), url.clone());
                map.insert("revision".to_string(), revision.clone());
            }
            Output::Image(image) => {
                map.insert("image".to_string(), image.clone());
            }
            Output::Config(config) => {
                map.insert("config".to_string(), config.clone());
            }
            Output::None => {}
        }
        map
    }
}

/// Upstream outputs a slot consumes, keyed by the reference's declared name.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub sources: BTreeMap<String, (Value, Value)>,
    pub images: BTreeMap<String, Value>,
    pub configs: BTreeMap<String, Value>,
    pub deployment: Option<(Value, Value)>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("missing value at path [{path}]: {problem}")]
    MissingValue { path: String, problem: String },
    #[error("deployment not ready: {0}")]
    DeploymentNotReady(String),
    #[error("deployment failed: observed [{key}] = [{value}]")]
    DeploymentFailed { key: String, value: String },
}

impl ExtractError {
    /// The JSONPath involved, for diagnostics.
    pub fn path(&self) -> Option<&str> {
        match self {
            ExtractError::MissingValue { path, .. } => Some(path),
            _ => None,
        }
    }
}

pub enum TemplateModel {
    Source(ClusterSourceTemplate),
    Image(ClusterImageTemplate),
    Config(ClusterConfigTemplate),
    Plain(ClusterTemplate),
    Deployment(ClusterDeploymentTemplate),
}

impl TemplateModel {
    pub fn kind(&self) -> &'static str {
        match self {
            TemplateModel::Source(_) => "ClusterSourceTemplate",
            TemplateModel::Image(_) => "ClusterImageTemplate",
            TemplateModel::Config(_) => "ClusterConfigTemplate",
            TemplateModel::Plain(_) => "ClusterTemplate",
            TemplateModel::Deployment(_) => "ClusterDeploymentTemplate",
        }
    }

    pub fn name(&self) -> String {
        let meta = match self {
            TemplateModel::Source(t) => &t.metadata,
            TemplateModel::Image(t) => &t.metadata,
            TemplateModel::Config(t) => &t.metadata,
            TemplateModel::Plain(t) => &t.metadata,
            TemplateModel::Deployment(t) => &t.metadata,
        };
        crate::name_or_default(meta)
    }

    /// The `template` body. `ytt` bodies are interpolated by the external
    /// engine and are absent here.
    pub fn body(&self) -> Option<&Value> {
        match self {
            TemplateModel::Source(t) => t.spec.template.as_ref(),
            TemplateModel::Image(t) => t.spec.template.as_ref(),
            TemplateModel::Config(t) => t.spec.template.as_ref(),
            TemplateModel::Plain(t) => t.spec.template.as_ref(),
            TemplateModel::Deployment(t) => t.spec.template.as_ref(),
        }
    }

    pub fn default_params(&self) -> &[BlueprintParam] {
        match self {
            TemplateModel::Source(t) => &t.spec.params,
            TemplateModel::Image(t) => &t.spec.params,
            TemplateModel::Config(t) => &t.spec.params,
            TemplateModel::Plain(t) => &t.spec.params,
            TemplateModel::Deployment(t) => &t.spec.params,
        }
    }

    /// Extract this template's typed output from the observed state of the
    /// stamped object.
    pub fn output(
        &self,
        evaluator: &dyn Evaluator,
        observed: &Value,
        inputs: &Inputs,
    ) -> Result<Output, ExtractError> {
        let eval = |path: &str| {
            evaluator
                .evaluate(path, observed)
                .map_err(|e| ExtractError::MissingValue {
                    path: path.to_string(),
                    problem: e.problem,
                })
        };
        match self {
            TemplateModel::Source(t) => Ok(Output::Source {
                url: eval(&t.spec.url_path)?,
                revision: eval(&t.spec.revision_path)?,
            }),
            TemplateModel::Image(t) => Ok(Output::Image(eval(&t.spec.image_path)?)),
            TemplateModel::Config(t) => Ok(Output::Config(eval(&t.spec.config_path)?)),
            TemplateModel::Plain(_) => Ok(Output::None),
            TemplateModel::Deployment(t) => {
                if let Some(completion) = &t.spec.observed_completion {
                    check_observed_completion(evaluator, observed, completion)?;
                } else {
                    for m in &t.spec.observed_matches {
                        let input = eval(&m.input)?;
                        let output = eval(&m.output)?;
                        if input != output {
                            return Err(ExtractError::DeploymentNotReady(format!(
                                "input [{}] has not propagated to output [{}]",
                                m.input, m.output
                            )));
                        }
                    }
                }
                let (url, revision) = inputs.deployment.clone().ok_or_else(|| {
                    ExtractError::DeploymentNotReady("no deployment input".to_string())
                })?;
                Ok(Output::Source { url, revision })
            }
        }
    }
}

fn check_observed_completion(
    evaluator: &dyn Evaluator,
    observed: &Value,
    completion: &crds::ObservedCompletion,
) -> Result<(), ExtractError> {
    let generation = evaluator
        .evaluate("$.metadata.generation", observed)
        .ok();
    let observed_generation = evaluator
        .evaluate("$.status.observedGeneration", observed)
        .ok();
    if generation.is_none() || generation != observed_generation {
        return Err(ExtractError::DeploymentNotReady(
            "status.observedGeneration does not match metadata.generation".to_string(),
        ));
    }
    if let Some(CompletionEvidence { key, value }) = &completion.failed {
        if let Ok(observed_value) = evaluator.evaluate(key, observed) {
            if value_as_string(&observed_value) == *value {
                return Err(ExtractError::DeploymentFailed {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
    }
    if let Some(CompletionEvidence { key, value }) = &completion.succeeded {
        let observed_value =
            evaluator
                .evaluate(key, observed)
                .map_err(|e| ExtractError::MissingValue {
                    path: key.clone(),
                    problem: e.problem,
                })?;
        if value_as_string(&observed_value) != *value {
            return Err(ExtractError::DeploymentNotReady(format!(
                "observed [{key}] does not equal [{value}]"
            )));
        }
    }
    Ok(())
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::PathEvaluator;
    use crds::{
        ClusterDeploymentTemplateSpec, ClusterSourceTemplateSpec, ObservedCompletion,
    };
    use serde_json::json;

    fn source_template() -> TemplateModel {
        TemplateModel::Source(ClusterSourceTemplate::new(
            "git",
            ClusterSourceTemplateSpec {
                url_path: "$.status.artifact.url".to_string(),
                revision_path: "$.status.artifact.revision".to_string(),
                template: Some(json!({"apiVersion": "v1", "kind": "GitRepository"})),
                ytt: None,
                params: vec![],
            },
        ))
    }

    #[test]
    fn source_outputs_url_and_revision() {
        let observed = json!({"status": {"artifact": {"url": "https://git/repo", "revision": "abc"}}});
        let out = source_template()
            .output(&PathEvaluator, &observed, &Inputs::default())
            .unwrap();
        assert_eq!(
            out,
            Output::Source {
                url: json!("https://git/repo"),
                revision: json!("abc")
            }
        );
    }

    #[test]
    fn missing_output_path_is_reported_with_the_path() {
        let observed = json!({"status": {}});
        let err = source_template()
            .output(&PathEvaluator, &observed, &Inputs::default())
            .unwrap_err();
        assert_eq!(err.path(), Some("$.status.artifact.url"));
    }

    #[test]
    fn deployment_passes_its_input_through_once_complete() {
        let template = TemplateModel::Deployment(ClusterDeploymentTemplate::new(
            "deploy",
            ClusterDeploymentTemplateSpec {
                observed_completion: Some(ObservedCompletion {
                    succeeded: Some(CompletionEvidence {
                        key: "$.status.phase".to_string(),
                        value: "Running".to_string(),
                    }),
                    failed: None,
                }),
                observed_matches: vec![],
                template: Some(json!({"apiVersion": "v1", "kind": "Deployment"})),
                ytt: None,
                params: vec![],
            },
        ));
        let observed = json!({
            "metadata": {"generation": 2},
            "status": {"observedGeneration": 2, "phase": "Running"},
        });
        let inputs = Inputs {
            deployment: Some((json!("https://git/repo"), json!("abc"))),
            ..Default::default()
        };
        let out = template.output(&PathEvaluator, &observed, &inputs).unwrap();
        assert_eq!(
            out,
            Output::Source {
                url: json!("https://git/repo"),
                revision: json!("abc")
            }
        );

        let stale = json!({
            "metadata": {"generation": 3},
            "status": {"observedGeneration": 2, "phase": "Running"},
        });
        assert!(template.output(&PathEvaluator, &stale, &inputs).is_err());
    }
}
