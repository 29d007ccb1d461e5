// SPDX-License-Identifier: MIT

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::blueprints::BlueprintParam;

/// Path/value pair a deployment's completion is judged against.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct CompletionEvidence {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ObservedCompletion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<CompletionEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<CompletionEvidence>,
}

/// Requires the value at `input` to have propagated to `output` on the
/// stamped object.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ObservedMatch {
    pub input: String,
    pub output: String,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterSourceTemplate",
    plural = "clustersourcetemplates"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSourceTemplateSpec {
    pub url_path: String,
    pub revision_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterImageTemplate",
    plural = "clusterimagetemplates"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterImageTemplateSpec {
    pub image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterConfigTemplate",
    plural = "clusterconfigtemplates"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigTemplateSpec {
    pub config_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
}

/// Terminal template: stamps an object, produces no output.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterTemplate",
    plural = "clustertemplates"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterDeploymentTemplate",
    plural = "clusterdeploymenttemplates"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_completion: Option<ObservedCompletion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed_matches: Vec<ObservedMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterRunTemplate",
    plural = "clusterruntemplates"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRunTemplateSpec {
    pub template: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}
