// SPDX-License-Identifier: MIT

use crds::{BlueprintResource, ClusterDelivery, ClusterSupplyChain, ServiceAccountRef, TemplateRef};
use kube::core::DynamicObject;
use kube::Client;
use log::info;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{apply_stamped, merge_params, IntentContext};
use crate::dag;
use crate::errors::RealizeError;
use crate::eval::Evaluator;
use crate::repository::Repository;
use crate::stamp::{stamp_context, Stamper};
use crate::templates::Output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlueprintKind {
    SupplyChain,
    Delivery,
}

/// Normalized form of the two blueprint kinds; the realizer is agnostic to
/// which one it came from.
pub struct Blueprint {
    pub name: String,
    pub kind: BlueprintKind,
    pub resources: Vec<BlueprintResource>,
    pub service_account_ref: Option<ServiceAccountRef>,
}

impl Blueprint {
    pub fn from_supply_chain(chain: &ClusterSupplyChain) -> Self {
        Self {
            name: crate::name_or_default(&chain.metadata),
            kind: BlueprintKind::SupplyChain,
            resources: chain.spec.resources.clone(),
            service_account_ref: chain.spec.service_account_ref.clone(),
        }
    }

    pub fn from_delivery(delivery: &ClusterDelivery) -> Self {
        Self {
            name: crate::name_or_default(&delivery.metadata),
            kind: BlueprintKind::Delivery,
            resources: delivery.spec.resources.clone(),
            service_account_ref: delivery.spec.service_account_ref.clone(),
        }
    }
}

/// What one slot produced this reconcile.
pub struct RealizedSlot {
    pub name: String,
    pub template_ref: TemplateRef,
    pub stamped: Option<DynamicObject>,
    pub outputs: BTreeMap<String, Value>,
}

pub struct ChainRealizer<'a> {
    pub repo: &'a Repository,
    pub stamp_client: Client,
    pub evaluator: &'a dyn Evaluator,
}

impl ChainRealizer<'_> {
    /// Walk the blueprint in dependency order, stamping each slot and feeding
    /// its outputs downstream. Stops at the first error, except a Forbidden
    /// apply, which is recorded and skipped so one denied resource does not
    /// mask status on the rest.
    pub async fn realize(
        &self,
        intent: &IntentContext,
        blueprint: &Blueprint,
    ) -> (Vec<RealizedSlot>, Option<RealizeError>) {
        let mut slots = Vec::new();
        let mut outputs: BTreeMap<String, Output> = BTreeMap::new();
        let mut first_error: Option<RealizeError> = None;

        let ordered = match dag::walk(&blueprint.resources) {
            Ok(ordered) => ordered,
            Err(err) => return (slots, Some(err.into())),
        };

        for resource in ordered {
            match self.realize_resource(intent, blueprint, resource, &outputs).await {
                Ok((slot, output)) => {
                    outputs.insert(resource.name.clone(), output);
                    slots.push(slot);
                }
                Err(err) => {
                    let forbidden = err.is_forbidden();
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    slots.push(RealizedSlot {
                        name: resource.name.clone(),
                        template_ref: resource.template_ref.clone(),
                        stamped: None,
                        outputs: BTreeMap::new(),
                    });
                    if !forbidden {
                        break;
                    }
                }
            }
        }
        (slots, first_error)
    }

    async fn realize_resource(
        &self,
        intent: &IntentContext,
        blueprint: &Blueprint,
        resource: &BlueprintResource,
        outputs: &BTreeMap<String, Output>,
    ) -> Result<(RealizedSlot, Output), RealizeError> {
        let template = self
            .repo
            .template(&resource.template_ref)
            .await
            .map_err(|source| RealizeError::GetTemplate {
                template_ref: resource.template_ref.clone(),
                resource: resource.name.clone(),
                source,
            })?;

        let params = merge_params(template.default_params(), &resource.params, &intent.params);
        let inputs = dag::inputs_for(resource, outputs);
        let context = stamp_context(intent.key, intent.object.clone(), &params, &inputs);
        let labels = intent.labels(&blueprint.name, &resource.name, &template.name());

        let body = template
            .body()
            .ok_or_else(|| RealizeError::Stamp {
                resource: resource.name.clone(),
                source: crate::stamp::StampError::MissingBody,
            })?;
        let stamper = Stamper::new(context, intent.owner_reference(), &intent.namespace, labels);
        let stamped = stamper.stamp(body).map_err(|source| RealizeError::Stamp {
            resource: resource.name.clone(),
            source,
        })?;

        let live = apply_stamped(&self.stamp_client, &intent.namespace, &stamped)
            .await
            .map_err(|source| RealizeError::ApplyStampedObject {
                resource: resource.name.clone(),
                namespace: intent.namespace.clone(),
                name: stamped.metadata.name.clone().unwrap_or_default(),
                source,
            })?;
        info!(
            "applied [{}/{}] for resource [{}]",
            intent.namespace,
            live.metadata.name.clone().unwrap_or_default(),
            resource.name
        );

        let observed = serde_json::to_value(&live).map_err(|e| RealizeError::Stamp {
            resource: resource.name.clone(),
            source: crate::stamp::StampError::InvalidObject(e.to_string()),
        })?;
        let output = template
            .output(self.evaluator, &observed, &inputs)
            .map_err(|source| RealizeError::RetrieveOutput {
                resource: resource.name.clone(),
                object: live.metadata.name.clone().unwrap_or_default(),
                source,
            })?;

        let slot = RealizedSlot {
            name: resource.name.clone(),
            template_ref: resource.template_ref.clone(),
            stamped: Some(live),
            outputs: output.to_status_map(),
        };
        Ok((slot, output))
    }
}
