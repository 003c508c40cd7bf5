use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::reflector::Store;
use mesh_hub_crds::labels;
use mesh_hub_crds::v1alpha1::mesh::{Mesh, MeshType};
use mesh_hub_k8s_utils::{EventFeed, EventHandler, HandlerError, HandlerId, Predicate};
use tracing::{info, instrument};

use crate::Result;
use crate::context::DiscoveryContext;

fn is_account_scoped(mesh: &Mesh) -> bool {
    mesh.spec.mesh_type().is_some_and(|t| t.is_account_scoped())
}

/// Tracks which clusters host each account-scoped mesh. Presence is derived
/// from sidecars in the cluster's pods and written to the mesh's hosting
/// cluster list.
pub struct ClusterTenancyFinder {
    ctx: Arc<DiscoveryContext>,
    pods: Store<Pod>,
}

impl ClusterTenancyFinder {
    pub fn new(ctx: Arc<DiscoveryContext>, pods: Store<Pod>) -> Self {
        Self { ctx, pods }
    }

    /// Registers for the cluster's pod events and for account-scoped mesh
    /// events. The returned id belongs to the mesh feed.
    pub fn start_discovery(
        self: &Arc<Self>,
        pods: &dyn EventFeed<Pod>,
        meshes: &dyn EventFeed<Mesh>,
    ) -> Result<HandlerId> {
        pods.add_event_handler(self.clone(), vec![])?;
        let account_scoped: Predicate<Mesh> = Arc::new(is_account_scoped);
        Ok(meshes.add_event_handler(self.clone(), vec![account_scoped])?)
    }

    async fn account_scoped_meshes(&self) -> Result<Vec<Arc<Mesh>>> {
        let selector = labels::account_scoped_meshes(MeshType::AppMesh);
        let meshes = self.ctx.records.meshes.list(&selector).await?;
        Ok(meshes.into_iter().map(Arc::new).collect())
    }

    /// The recorded account-scoped mesh whose sidecar runs in `pod`. A pod
    /// of a mesh that has not been recorded yet yields `None`.
    pub async fn mesh_from_sidecar(&self, pod: &Pod) -> Result<Option<Arc<Mesh>>> {
        let meshes = self.account_scoped_meshes().await?;
        self.ctx.scanners.scan_pod(pod, &meshes)
    }

    /// Adds this cluster to the mesh's hosting clusters. Returns whether a
    /// write happened.
    pub async fn register_mesh(&self, mesh: &Mesh) -> Result<bool> {
        let cluster = &self.ctx.cluster;
        let mut updated = mesh.clone();
        let Some(app_mesh) = updated.spec.aws_app_mesh.as_mut() else {
            return Ok(false);
        };
        if app_mesh.clusters.contains(cluster) {
            return Ok(false);
        }
        app_mesh.clusters.push(cluster.clone());
        app_mesh.clusters.sort();
        info!(mesh = %mesh.name_any(), %cluster, "cluster joined mesh");
        self.ctx.records.meshes.update(&updated).await?;
        Ok(true)
    }

    /// Removes this cluster from the mesh's hosting clusters. Returns whether
    /// a write happened.
    pub async fn deregister_mesh(&self, mesh: &Mesh) -> Result<bool> {
        let cluster = &self.ctx.cluster;
        let mut updated = mesh.clone();
        let Some(app_mesh) = updated.spec.aws_app_mesh.as_mut() else {
            return Ok(false);
        };
        if !app_mesh.clusters.contains(cluster) {
            return Ok(false);
        }
        app_mesh.clusters.retain(|c| c != cluster);
        info!(mesh = %mesh.name_any(), %cluster, "cluster left mesh");
        self.ctx.records.meshes.update(&updated).await?;
        Ok(true)
    }

    #[instrument(skip(self, pod), fields(cluster = %self.ctx.cluster, pod = %pod.name_any()))]
    async fn pod_created(&self, pod: &Pod) -> Result<()> {
        if let Some(mesh) = self.mesh_from_sidecar(pod).await? {
            self.register_mesh(&mesh).await?;
        }
        Ok(())
    }

    /// Recomputes tenancy of every account-scoped mesh from all live pods.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster))]
    pub async fn recompute(&self) -> Result<()> {
        let meshes = self.account_scoped_meshes().await?;
        let mut hosted = BTreeSet::new();
        for pod in self.pods.state() {
            if let Some(mesh) = self.ctx.scanners.scan_pod(&pod, &meshes)? {
                hosted.insert(mesh.name_any());
            }
        }
        for mesh in &meshes {
            if hosted.contains(&mesh.name_any()) {
                self.register_mesh(mesh).await?;
            } else {
                self.deregister_mesh(mesh).await?;
            }
        }
        Ok(())
    }

    /// Removes this cluster from every account-scoped mesh.
    pub async fn deregister_all(&self) -> Result<()> {
        for mesh in self.account_scoped_meshes().await? {
            self.deregister_mesh(&mesh).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Pod> for ClusterTenancyFinder {
    async fn on_create(&self, obj: Arc<Pod>) -> Result<(), HandlerError> {
        Ok(self.pod_created(&obj).await?)
    }

    async fn on_update(&self, _old: Arc<Pod>, _new: Arc<Pod>) -> Result<(), HandlerError> {
        Ok(self.recompute().await?)
    }

    async fn on_delete(&self, _obj: Arc<Pod>) -> Result<(), HandlerError> {
        Ok(self.recompute().await?)
    }
}

#[async_trait]
impl EventHandler<Mesh> for ClusterTenancyFinder {
    async fn on_create(&self, _obj: Arc<Mesh>) -> Result<(), HandlerError> {
        Ok(self.recompute().await?)
    }

    async fn on_update(&self, _old: Arc<Mesh>, _new: Arc<Mesh>) -> Result<(), HandlerError> {
        Ok(self.recompute().await?)
    }

    async fn on_delete(&self, _obj: Arc<Mesh>) -> Result<(), HandlerError> {
        Ok(self.recompute().await?)
    }
}
