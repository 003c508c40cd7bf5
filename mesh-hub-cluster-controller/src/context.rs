use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use mesh_hub_crds::v1alpha1::cluster::KubernetesCluster;
use mesh_hub_multicluster::ManagerController;

pub struct Context {
    pub clusters: Api<KubernetesCluster>,
    pub secrets: Api<Secret>,
    pub controller: Arc<ManagerController>,
    /// Digest of the kubeconfig each cluster was registered with. Clusters
    /// registered by other means have no entry and are left alone.
    pub applied: DashMap<String, String>,
}

impl Context {
    pub fn new(client: Client, namespace: &str, controller: Arc<ManagerController>) -> Self {
        Self {
            clusters: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
            controller,
            applied: DashMap::new(),
        }
    }
}
