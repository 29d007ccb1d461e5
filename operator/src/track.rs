// SPDX-License-Identifier: MIT

//! Dynamic watches: every stamped object kind seen at runtime is registered
//! once, and subsequent changes to objects of that kind enqueue the owning
//! intent.

use futures_util::StreamExt;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

pub struct DynamicTracker<K: Resource> {
    client: Client,
    tx: UnboundedSender<ObjectRef<K>>,
    registered: Arc<Mutex<HashSet<String>>>,
}

impl<K> DynamicTracker<K>
where
    K: Resource<DynamicType = ()> + Send + 'static,
{
    pub fn new(client: Client, tx: UnboundedSender<ObjectRef<K>>) -> Self {
        Self {
            client,
            tx,
            registered: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register the stamped object's kind for watching. Idempotent: the
    /// registry is keyed by group/version/kind per owner kind, so repeated
    /// stampings of the same kind are a no-op.
    pub fn watch(&self, object: &DynamicObject) -> anyhow::Result<()> {
        let types = object
            .types
            .clone()
            .ok_or_else(|| anyhow::anyhow!("stamped object has no type meta"))?;
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), types.api_version.clone()),
        };
        let gvk = GroupVersionKind::gvk(&group, &version, &types.kind);
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);

        {
            let mut registered = self
                .registered
                .lock()
                .map_err(|_| anyhow::anyhow!("tracker registry poisoned"))?;
            if !registered.insert(key.clone()) {
                return Ok(());
            }
        }
        debug!("tracking stamped kind [{key}]");

        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &ApiResource::from_gvk(&gvk));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut stream =
                watcher(api, watcher::Config::default()).touched_objects().boxed();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(object) => {
                        for owner in owners_of(&object) {
                            if tx.send(owner).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("watch on [{key}] failed: {e}"),
                }
            }
        });
        Ok(())
    }
}

/// ObjectRefs for every owner reference on the object that is of the tracked
/// intent kind.
fn owners_of<K>(object: &DynamicObject) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = object.metadata.namespace.clone();
    object
        .owner_references()
        .iter()
        .filter(|o| o.kind == K::kind(&()) && o.api_version == K::api_version(&()))
        .map(|o| {
            let mut reference = ObjectRef::new(&o.name);
            if let Some(ns) = &namespace {
                reference = reference.within(ns);
            }
            reference
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::Workload;
    use kube::core::TypeMeta;

    #[test]
    fn owners_are_filtered_by_kind() {
        let mut object = DynamicObject::new("stamped", &ApiResource::from_gvk(
            &GroupVersionKind::gvk("example.dev", "v1", "GitRepository"),
        ))
        .within("dev");
        object.types = Some(TypeMeta {
            api_version: "example.dev/v1".to_string(),
            kind: "GitRepository".to_string(),
        });
        object.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "carto.run/v1alpha1".to_string(),
                kind: "Workload".to_string(),
                name: "w".to_string(),
                uid: "u".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "other".to_string(),
                uid: "u2".to_string(),
                controller: None,
                block_owner_deletion: None,
            },
        ]);
        let owners = owners_of::<Workload>(&object);
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "w");
    }
}
