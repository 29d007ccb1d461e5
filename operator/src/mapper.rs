// SPDX-License-Identifier: MIT

//! Reverse lookups: given a change event on any watched kind, which intent
//! objects must be re-queued. The mapper is reactivity, not correctness: a
//! lookup failure downgrades to an empty result with a warning, and the next
//! resync recovers anything missed.

use crds::{ClusterDelivery, ClusterSupplyChain, Deliverable, Runnable, Workload};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::ListParams;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, Resource};
use log::warn;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;

use crate::selector::{select_best, BestMatch, Selectable};

pub struct Mapper {
    client: Client,
}

impl Mapper {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_all<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!("mapper list {} failed: {e}", K::kind(&()));
                Vec::new()
            }
        }
    }

    /// Template change → workloads of every supply chain that references it.
    pub async fn template_to_workloads(&self, kind: &str, name: &str) -> Vec<ObjectRef<Workload>> {
        let chains: Vec<ClusterSupplyChain> = self.list_all().await;
        let workloads: Vec<Workload> = self.list_all().await;
        let mut requests = HashSet::new();
        for chain in blueprints_referencing_template(&chains, kind, name) {
            let chain_name = crate::name_or_default(&chain.metadata);
            requests.extend(intents_best_matched(&chain_name, &chains, &workloads));
        }
        requests.into_iter().collect()
    }

    pub async fn template_to_deliverables(
        &self,
        kind: &str,
        name: &str,
    ) -> Vec<ObjectRef<Deliverable>> {
        let deliveries: Vec<ClusterDelivery> = self.list_all().await;
        let deliverables: Vec<Deliverable> = self.list_all().await;
        let mut requests = HashSet::new();
        for delivery in blueprints_referencing_template(&deliveries, kind, name) {
            let delivery_name = crate::name_or_default(&delivery.metadata);
            requests.extend(intents_best_matched(&delivery_name, &deliveries, &deliverables));
        }
        requests.into_iter().collect()
    }

    /// Blueprint change → intents whose best match is the changed blueprint.
    /// Intents merely matched by a non-best blueprint are left alone.
    pub async fn supply_chain_to_workloads(&self, chain_name: &str) -> Vec<ObjectRef<Workload>> {
        let chains: Vec<ClusterSupplyChain> = self.list_all().await;
        let workloads: Vec<Workload> = self.list_all().await;
        intents_best_matched(chain_name, &chains, &workloads)
    }

    pub async fn delivery_to_deliverables(&self, delivery_name: &str) -> Vec<ObjectRef<Deliverable>> {
        let deliveries: Vec<ClusterDelivery> = self.list_all().await;
        let deliverables: Vec<Deliverable> = self.list_all().await;
        intents_best_matched(delivery_name, &deliveries, &deliverables)
    }

    pub async fn run_template_to_runnables(&self, name: &str) -> Vec<ObjectRef<Runnable>> {
        let runnables: Vec<Runnable> = self.list_all().await;
        runnables
            .iter()
            .filter(|r| run_template_ref_matches(r, name))
            .filter_map(intent_ref)
            .collect()
    }

    pub async fn service_account_to_workloads(
        &self,
        sa_name: &str,
        sa_namespace: &str,
    ) -> Vec<ObjectRef<Workload>> {
        let chains: Vec<ClusterSupplyChain> = self.list_all().await;
        let workloads: Vec<Workload> = self.list_all().await;
        let mut requests: HashSet<ObjectRef<Workload>> = workloads
            .iter()
            .filter(|w| {
                w.metadata.namespace.as_deref() == Some(sa_namespace)
                    && w.spec.service_account_name.as_deref() == Some(sa_name)
            })
            .filter_map(intent_ref)
            .collect();

        for chain in &chains {
            let reference = match &chain.spec.service_account_ref {
                Some(reference) if reference.name == sa_name => reference,
                _ => continue,
            };
            let chain_name = crate::name_or_default(&chain.metadata);
            for request in intents_best_matched(&chain_name, &chains, &workloads) {
                let Some(workload) = workloads.iter().find(|w| {
                    w.metadata.name.as_deref() == Some(request.name.as_str())
                        && w.metadata.namespace.as_deref() == request.namespace.as_deref()
                }) else {
                    continue;
                };
                if workload.spec.service_account_name.is_some() {
                    continue;
                }
                let in_scope = match &reference.namespace {
                    Some(ns) => ns == sa_namespace,
                    None => workload.metadata.namespace.as_deref() == Some(sa_namespace),
                };
                if in_scope {
                    requests.insert(request);
                }
            }
        }
        requests.into_iter().collect()
    }

    pub async fn service_account_to_deliverables(
        &self,
        sa_name: &str,
        sa_namespace: &str,
    ) -> Vec<ObjectRef<Deliverable>> {
        let deliveries: Vec<ClusterDelivery> = self.list_all().await;
        let deliverables: Vec<Deliverable> = self.list_all().await;
        let mut requests: HashSet<ObjectRef<Deliverable>> = deliverables
            .iter()
            .filter(|d| {
                d.metadata.namespace.as_deref() == Some(sa_namespace)
                    && d.spec.service_account_name.as_deref() == Some(sa_name)
            })
            .filter_map(intent_ref)
            .collect();

        for delivery in &deliveries {
            let reference = match &delivery.spec.service_account_ref {
                Some(reference) if reference.name == sa_name => reference,
                _ => continue,
            };
            let delivery_name = crate::name_or_default(&delivery.metadata);
            for request in intents_best_matched(&delivery_name, &deliveries, &deliverables) {
                let Some(deliverable) = deliverables.iter().find(|d| {
                    d.metadata.name.as_deref() == Some(request.name.as_str())
                        && d.metadata.namespace.as_deref() == request.namespace.as_deref()
                }) else {
                    continue;
                };
                if deliverable.spec.service_account_name.is_some() {
                    continue;
                }
                let in_scope = match &reference.namespace {
                    Some(ns) => ns == sa_namespace,
                    None => deliverable.metadata.namespace.as_deref() == Some(sa_namespace),
                };
                if in_scope {
                    requests.insert(request);
                }
            }
        }
        requests.into_iter().collect()
    }

    pub async fn service_account_to_runnables(
        &self,
        sa_name: &str,
        sa_namespace: &str,
    ) -> Vec<ObjectRef<Runnable>> {
        let runnables: Vec<Runnable> = self.list_all().await;
        runnables
            .iter()
            .filter(|r| {
                r.metadata.namespace.as_deref() == Some(sa_namespace)
                    && r.spec.service_account_name.as_deref() == Some(sa_name)
            })
            .filter_map(intent_ref)
            .collect()
    }

    /// RBAC walk: service accounts a role binding grants to.
    pub fn role_binding_service_accounts(binding: &RoleBinding) -> Vec<(String, String)> {
        let binding_namespace = binding.metadata.namespace.clone().unwrap_or_default();
        binding
            .subjects
            .iter()
            .flatten()
            .filter(|s| s.kind == "ServiceAccount")
            .map(|s| {
                (
                    s.name.clone(),
                    s.namespace.clone().unwrap_or_else(|| binding_namespace.clone()),
                )
            })
            .collect()
    }

    pub fn cluster_role_binding_service_accounts(
        binding: &ClusterRoleBinding,
    ) -> Vec<(String, String)> {
        binding
            .subjects
            .iter()
            .flatten()
            .filter(|s| s.kind == "ServiceAccount")
            .map(|s| (s.name.clone(), s.namespace.clone().unwrap_or_default()))
            .collect()
    }

    /// Roles are resolved by listing bindings and following `roleRef`.
    pub async fn role_service_accounts(&self, role: &Role) -> Vec<(String, String)> {
        let bindings: Vec<RoleBinding> = self.list_all().await;
        let mut accounts = Vec::new();
        for binding in &bindings {
            if binding.role_ref.kind == "Role"
                && Some(binding.role_ref.name.as_str()) == role.metadata.name.as_deref()
                && binding.metadata.namespace == role.metadata.namespace
            {
                accounts.extend(Self::role_binding_service_accounts(binding));
            }
        }
        accounts
    }

    pub async fn cluster_role_service_accounts(&self, role: &ClusterRole) -> Vec<(String, String)> {
        let role_name = role.metadata.name.as_deref();
        let mut accounts = Vec::new();
        let cluster_bindings: Vec<ClusterRoleBinding> = self.list_all().await;
        for binding in &cluster_bindings {
            if binding.role_ref.kind == "ClusterRole"
                && Some(binding.role_ref.name.as_str()) == role_name
            {
                accounts.extend(Self::cluster_role_binding_service_accounts(binding));
            }
        }
        let bindings: Vec<RoleBinding> = self.list_all().await;
        for binding in &bindings {
            if binding.role_ref.kind == "ClusterRole"
                && Some(binding.role_ref.name.as_str()) == role_name
            {
                accounts.extend(Self::role_binding_service_accounts(binding));
            }
        }
        accounts
    }
}

fn intent_ref<K: Resource<DynamicType = ()>>(intent: &K) -> Option<ObjectRef<K>> {
    let name = intent.meta().name.as_ref()?;
    let mut reference = ObjectRef::new(name);
    if let Some(ns) = &intent.meta().namespace {
        reference = reference.within(ns);
    }
    Some(reference)
}

/// Blueprints whose resource slots reference the given template.
pub fn blueprints_referencing_template<'a, B: BlueprintResources>(
    blueprints: &'a [B],
    kind: &str,
    name: &str,
) -> Vec<&'a B> {
    blueprints
        .iter()
        .filter(|b| {
            b.resources()
                .iter()
                .any(|r| r.template_ref.kind == kind && r.template_ref.name == name)
        })
        .collect()
}

/// Intents whose single best-matching blueprint is the named one.
pub fn intents_best_matched<B, K>(
    blueprint_name: &str,
    blueprints: &[B],
    intents: &[K],
) -> Vec<ObjectRef<K>>
where
    B: Selectable,
    K: Resource<DynamicType = ()>,
{
    intents
        .iter()
        .filter(|intent| {
            let labels: BTreeMap<String, String> =
                intent.meta().labels.clone().unwrap_or_default();
            matches!(
                select_best(&labels, blueprints),
                BestMatch::Best(best) if best.name() == blueprint_name
            )
        })
        .filter_map(intent_ref)
        .collect()
}

fn run_template_ref_matches(runnable: &Runnable, template_name: &str) -> bool {
    let reference = &runnable.spec.run_template_ref;
    reference.name == template_name
        && (reference.kind.is_empty() || reference.kind == "ClusterRunTemplate")
}

/// Access to a blueprint's resource slots, shared by both blueprint kinds.
pub trait BlueprintResources {
    fn resources(&self) -> &[crds::BlueprintResource];
}

impl BlueprintResources for ClusterSupplyChain {
    fn resources(&self) -> &[crds::BlueprintResource] {
        &self.spec.resources
    }
}

impl BlueprintResources for ClusterDelivery {
    fn resources(&self) -> &[crds::BlueprintResource] {
        &self.spec.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{
        BlueprintResource, ClusterSupplyChainSpec, Selector, TemplateRef, WorkloadSpec,
    };
    use kube::api::ObjectMeta;

    fn chain(name: &str, labels: &[(&str, &str)], template: Option<(&str, &str)>) -> ClusterSupplyChain {
        ClusterSupplyChain::new(
            name,
            ClusterSupplyChainSpec {
                selector: Selector {
                    match_labels: labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    match_expressions: vec![],
                },
                resources: template
                    .map(|(kind, name)| {
                        vec![BlueprintResource {
                            name: "src".to_string(),
                            template_ref: TemplateRef {
                                kind: kind.to_string(),
                                name: name.to_string(),
                            },
                            params: vec![],
                            sources: vec![],
                            images: vec![],
                            configs: vec![],
                            deployment: None,
                        }]
                    })
                    .unwrap_or_default(),
                service_account_ref: None,
            },
        )
    }

    fn workload(name: &str, labels: &[(&str, &str)]) -> Workload {
        Workload {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("dev".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: WorkloadSpec {
                source: None,
                image: None,
                params: vec![],
                service_account_name: None,
            },
            status: None,
        }
    }

    #[test]
    fn referencing_blueprints_are_found_by_kind_and_name() {
        let chains = vec![
            chain("uses-git", &[], Some(("ClusterSourceTemplate", "git"))),
            chain("uses-other", &[], Some(("ClusterSourceTemplate", "other"))),
            chain("wrong-kind", &[], Some(("ClusterImageTemplate", "git"))),
        ];
        let hits = blueprints_referencing_template(&chains, "ClusterSourceTemplate", "git");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.name.as_deref(), Some("uses-git"));
    }

    #[test]
    fn only_best_matched_intents_are_enqueued() {
        // Both chains match `w`, but the more specific one is the best match:
        // a change to the broad chain must not wake the workload.
        let chains = vec![
            chain("broad", &[("app", "web")], None),
            chain("narrow", &[("app", "web"), ("env", "prod")], None),
        ];
        let workloads = vec![workload("w", &[("app", "web"), ("env", "prod")])];
        assert!(intents_best_matched("broad", &chains, &workloads).is_empty());
        let hits = intents_best_matched("narrow", &chains, &workloads);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "w");
    }

    #[test]
    fn ambiguous_matches_enqueue_nothing() {
        let chains = vec![
            chain("one", &[("app", "web")], None),
            chain("two", &[("app", "web")], None),
        ];
        let workloads = vec![workload("w", &[("app", "web")])];
        assert!(intents_best_matched("one", &chains, &workloads).is_empty());
        assert!(intents_best_matched("two", &chains, &workloads).is_empty());
    }

    #[test]
    fn run_template_ref_matches_on_name_and_optional_kind() {
        let mut runnable = Runnable::new(
            "r",
            crds::RunnableSpec {
                run_template_ref: TemplateRef {
                    kind: String::new(),
                    name: "run".to_string(),
                },
                inputs: Default::default(),
                service_account_name: None,
                selector: None,
            },
        );
        assert!(run_template_ref_matches(&runnable, "run"));
        assert!(!run_template_ref_matches(&runnable, "other"));
        runnable.spec.run_template_ref.kind = "ClusterRunTemplate".to_string();
        assert!(run_template_ref_matches(&runnable, "run"));
        runnable.spec.run_template_ref.kind = "SomethingElse".to_string();
        assert!(!run_template_ref_matches(&runnable, "run"));
    }

    #[test]
    fn role_binding_subjects_default_to_the_binding_namespace() {
        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some("rb".to_string()),
                namespace: Some("dev".to_string()),
                ..Default::default()
            },
            role_ref: k8s_openapi::api::rbac::v1::RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: "stamper".to_string(),
            },
            subjects: Some(vec![
                k8s_openapi::api::rbac::v1::Subject {
                    kind: "ServiceAccount".to_string(),
                    name: "builder".to_string(),
                    namespace: None,
                    api_group: None,
                },
                k8s_openapi::api::rbac::v1::Subject {
                    kind: "User".to_string(),
                    name: "alice".to_string(),
                    namespace: None,
                    api_group: Some("rbac.authorization.k8s.io".to_string()),
                },
            ]),
        };
        let accounts = Mapper::role_binding_service_accounts(&binding);
        assert_eq!(accounts, vec![("builder".to_string(), "dev".to_string())]);
    }
}
