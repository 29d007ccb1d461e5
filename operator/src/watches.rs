// SPDX-License-Identifier: MIT

//! Reactive watches: every kind that can affect an intent's reconciliation is
//! watched, and each change event runs through the mapper to enqueue the
//! intents it can touch.

use crds::{
    ClusterConfigTemplate, ClusterDelivery, ClusterDeploymentTemplate, ClusterImageTemplate,
    ClusterRunTemplate, ClusterSourceTemplate, ClusterSupplyChain, ClusterTemplate, Deliverable,
    Runnable, Workload,
};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use log::warn;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::mapper::Mapper;

/// Watch every object of kind `W`; on each touch, run `map` and enqueue the
/// produced intent references. Watch failures are logged and retried by the
/// watcher itself.
pub fn spawn_watch<W, K, F, Fut>(client: Client, tx: UnboundedSender<ObjectRef<K>>, map: F)
where
    W: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    W::DynamicType: Default + Eq + Hash + Clone,
    K: Resource<DynamicType = ()> + Send + 'static,
    F: Fn(W) -> Fut + Send + 'static,
    Fut: Future<Output = Vec<ObjectRef<K>>> + Send + 'static,
{
    let api: Api<W> = Api::all(client);
    tokio::spawn(async move {
        let mut stream = watcher(api, watcher::Config::default())
            .touched_objects()
            .boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(object) => {
                    for reference in map(object).await {
                        if tx.send(reference).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("reactive watch failed: {e}"),
            }
        }
    });
}

macro_rules! watch_template {
    ($client:expr, $tx:expr, $mapper:expr, $template:ty, $kind:literal, $method:ident) => {{
        let mapper = $mapper.clone();
        spawn_watch($client.clone(), $tx.clone(), move |t: $template| {
            let mapper = mapper.clone();
            let name = t.name_any();
            async move { mapper.$method($kind, &name).await }
        });
    }};
}

macro_rules! watch_rbac {
    ($client:expr, $tx:expr, $mapper:expr, $sa_method:ident) => {{
        let m = $mapper.clone();
        spawn_watch($client.clone(), $tx.clone(), move |sa: ServiceAccount| {
            let m = m.clone();
            let (name, ns) = (sa.name_any(), sa.namespace().unwrap_or_default());
            async move { m.$sa_method(&name, &ns).await }
        });
        let m = $mapper.clone();
        spawn_watch($client.clone(), $tx.clone(), move |rb: RoleBinding| {
            let m = m.clone();
            async move {
                let mut out = Vec::new();
                for (name, ns) in Mapper::role_binding_service_accounts(&rb) {
                    out.extend(m.$sa_method(&name, &ns).await);
                }
                out
            }
        });
        let m = $mapper.clone();
        spawn_watch($client.clone(), $tx.clone(), move |crb: ClusterRoleBinding| {
            let m = m.clone();
            async move {
                let mut out = Vec::new();
                for (name, ns) in Mapper::cluster_role_binding_service_accounts(&crb) {
                    out.extend(m.$sa_method(&name, &ns).await);
                }
                out
            }
        });
        let m = $mapper.clone();
        spawn_watch($client.clone(), $tx.clone(), move |role: Role| {
            let m = m.clone();
            async move {
                let mut out = Vec::new();
                for (name, ns) in m.role_service_accounts(&role).await {
                    out.extend(m.$sa_method(&name, &ns).await);
                }
                out
            }
        });
        let m = $mapper.clone();
        spawn_watch($client.clone(), $tx.clone(), move |role: ClusterRole| {
            let m = m.clone();
            async move {
                let mut out = Vec::new();
                for (name, ns) in m.cluster_role_service_accounts(&role).await {
                    out.extend(m.$sa_method(&name, &ns).await);
                }
                out
            }
        });
    }};
}

/// Everything that can affect a Workload: the five template kinds, the supply
/// chains, and the RBAC graph down to service accounts.
pub fn workload_watches(client: Client, tx: UnboundedSender<ObjectRef<Workload>>) {
    let mapper = Arc::new(Mapper::new(client.clone()));
    watch_template!(client, tx, mapper, ClusterSourceTemplate, "ClusterSourceTemplate", template_to_workloads);
    watch_template!(client, tx, mapper, ClusterImageTemplate, "ClusterImageTemplate", template_to_workloads);
    watch_template!(client, tx, mapper, ClusterConfigTemplate, "ClusterConfigTemplate", template_to_workloads);
    watch_template!(client, tx, mapper, ClusterTemplate, "ClusterTemplate", template_to_workloads);
    watch_template!(client, tx, mapper, ClusterDeploymentTemplate, "ClusterDeploymentTemplate", template_to_workloads);

    let m = mapper.clone();
    spawn_watch(client.clone(), tx.clone(), move |chain: ClusterSupplyChain| {
        let m = m.clone();
        let name = chain.name_any();
        async move { m.supply_chain_to_workloads(&name).await }
    });

    watch_rbac!(client, tx, mapper, service_account_to_workloads);
}

pub fn deliverable_watches(client: Client, tx: UnboundedSender<ObjectRef<Deliverable>>) {
    let mapper = Arc::new(Mapper::new(client.clone()));
    watch_template!(client, tx, mapper, ClusterSourceTemplate, "ClusterSourceTemplate", template_to_deliverables);
    watch_template!(client, tx, mapper, ClusterImageTemplate, "ClusterImageTemplate", template_to_deliverables);
    watch_template!(client, tx, mapper, ClusterConfigTemplate, "ClusterConfigTemplate", template_to_deliverables);
    watch_template!(client, tx, mapper, ClusterTemplate, "ClusterTemplate", template_to_deliverables);
    watch_template!(client, tx, mapper, ClusterDeploymentTemplate, "ClusterDeploymentTemplate", template_to_deliverables);

    let m = mapper.clone();
    spawn_watch(client.clone(), tx.clone(), move |delivery: ClusterDelivery| {
        let m = m.clone();
        let name = delivery.name_any();
        async move { m.delivery_to_deliverables(&name).await }
    });

    watch_rbac!(client, tx, mapper, service_account_to_deliverables);
}

pub fn runnable_watches(client: Client, tx: UnboundedSender<ObjectRef<Runnable>>) {
    let mapper = Arc::new(Mapper::new(client.clone()));
    let m = mapper.clone();
    spawn_watch(client.clone(), tx.clone(), move |t: ClusterRunTemplate| {
        let m = m.clone();
        let name = t.name_any();
        async move { m.run_template_to_runnables(&name).await }
    });

    watch_rbac!(client, tx, mapper, service_account_to_runnables);
}
