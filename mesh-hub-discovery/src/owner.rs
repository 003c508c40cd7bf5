use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::runtime::reflector::{ObjectRef, Store};

/// Resolves pods to the Deployment controlling them through the live
/// ReplicaSet and Deployment caches of the pod's cluster.
#[derive(Clone)]
pub struct OwnerResolver {
    replicasets: Store<ReplicaSet>,
    deployments: Store<Deployment>,
}

fn controller_of<'a>(owners: &'a [OwnerReference], kind: &str) -> Option<&'a OwnerReference> {
    owners
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == kind)
}

impl OwnerResolver {
    pub fn new(replicasets: Store<ReplicaSet>, deployments: Store<Deployment>) -> Self {
        Self {
            replicasets,
            deployments,
        }
    }

    /// `None` for pods not managed by a Deployment, or whose owners are not
    /// in the caches yet.
    pub fn deployment_for_pod(&self, pod: &Pod) -> Option<Arc<Deployment>> {
        let namespace = pod.namespace()?;
        let replicaset = controller_of(pod.owner_references(), "ReplicaSet")?;
        let replicaset = self
            .replicasets
            .get(&ObjectRef::new(&replicaset.name).within(&namespace))?;
        let deployment = controller_of(replicaset.owner_references(), "Deployment")?;
        self.deployments
            .get(&ObjectRef::new(&deployment.name).within(&namespace))
    }
}
