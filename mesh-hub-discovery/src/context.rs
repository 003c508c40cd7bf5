use std::sync::Arc;

use kube::Client;
use mesh_hub_crds::v1alpha1::{
    mesh::Mesh, mesh_service::MeshService, mesh_workload::MeshWorkload,
};
use mesh_hub_k8s_utils::{KubeRecordStore, RecordStore};

use crate::FIELD_MANAGER;
use crate::scanner::Scanners;

/// Clients for the records discovery writes on the management cluster.
#[derive(Clone)]
pub struct Records {
    pub meshes: Arc<dyn RecordStore<Mesh>>,
    pub workloads: Arc<dyn RecordStore<MeshWorkload>>,
    pub services: Arc<dyn RecordStore<MeshService>>,
}

impl Records {
    pub fn kube(client: Client, namespace: &str) -> Self {
        Self {
            meshes: Arc::new(KubeRecordStore::namespaced(
                client.clone(),
                namespace,
                FIELD_MANAGER,
            )),
            workloads: Arc::new(KubeRecordStore::namespaced(
                client.clone(),
                namespace,
                FIELD_MANAGER,
            )),
            services: Arc::new(KubeRecordStore::namespaced(client, namespace, FIELD_MANAGER)),
        }
    }
}

/// What every finder of one cluster shares.
pub struct DiscoveryContext {
    pub cluster: String,
    /// Namespace records are written to
    pub namespace: String,
    pub records: Records,
    pub scanners: Arc<Scanners>,
    pub prune_meshes: bool,
}
