use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::reflector::Store;
use mesh_hub_crds::labels;
use mesh_hub_crds::names;
use mesh_hub_crds::v1alpha1::mesh::{Mesh, MeshSpec, MeshType};
use mesh_hub_k8s_utils::{EventFeed, EventHandler, HandlerError, HandlerId};
use tracing::{debug, info, instrument};

use crate::context::DiscoveryContext;
use crate::{Error, Result, labels_cover};

/// Record name for a mesh installation. Cluster-local meshes are named by
/// install namespace and cluster, account-scoped meshes by their identity in
/// the account.
pub fn mesh_name(spec: &MeshSpec) -> Result<String> {
    if let Some(app_mesh) = &spec.aws_app_mesh {
        return Ok(names::account_scoped_mesh_name(
            MeshType::AppMesh,
            &app_mesh.name,
            &app_mesh.region,
            &app_mesh.aws_account_id,
        ));
    }
    let (mesh_type, installation) = match (&spec.istio, &spec.linkerd) {
        (Some(istio), _) => (MeshType::Istio, &istio.installation),
        (None, Some(linkerd)) => (MeshType::Linkerd, &linkerd.installation),
        (None, None) => return Err(Error::UntypedMesh),
    };
    let cluster = spec.cluster.as_ref().map(|c| c.name.as_str()).unwrap_or_default();
    Ok(names::cluster_local_mesh_name(
        mesh_type,
        &installation.installation_namespace,
        cluster,
    ))
}

/// Detects mesh control planes among one cluster's Deployments and records
/// them as Mesh records.
pub struct MeshFinder {
    ctx: Arc<DiscoveryContext>,
    deployments: Store<Deployment>,
}

impl MeshFinder {
    pub fn new(ctx: Arc<DiscoveryContext>, deployments: Store<Deployment>) -> Self {
        Self { ctx, deployments }
    }

    pub fn start_discovery(
        self: &Arc<Self>,
        deployments: &dyn EventFeed<Deployment>,
    ) -> Result<HandlerId> {
        Ok(deployments.add_event_handler(self.clone(), vec![])?)
    }

    fn record(&self, spec: MeshSpec) -> Result<Mesh> {
        let mesh_type = spec.mesh_type().ok_or(Error::UntypedMesh)?;
        let cluster = (!mesh_type.is_account_scoped()).then_some(self.ctx.cluster.as_str());
        Ok(Mesh {
            metadata: ObjectMeta {
                name: Some(mesh_name(&spec)?),
                namespace: Some(self.ctx.namespace.clone()),
                labels: Some(labels::mesh_labels(mesh_type, cluster)),
                ..Default::default()
            },
            spec,
        })
    }

    fn scan(&self, deployment: &Deployment) -> Result<Option<Mesh>> {
        self.ctx
            .scanners
            .scan_deployment(deployment, &self.ctx.cluster)?
            .map(|spec| self.record(spec))
            .transpose()
    }

    /// Writes `desired` unless the stored record already matches. Hosting
    /// clusters of account-scoped meshes belong to tenancy tracking and are
    /// carried over from the stored record.
    async fn apply(&self, mut desired: Mesh) -> Result<()> {
        let name = desired.name_any();
        let existing = self.ctx.records.meshes.get(&name).await?;
        if let Some(existing) = &existing {
            if let (Some(want), Some(have)) =
                (desired.spec.aws_app_mesh.as_mut(), &existing.spec.aws_app_mesh)
            {
                want.clusters = have.clusters.clone();
            }
            if existing.spec == desired.spec && labels_cover(existing.labels(), desired.labels()) {
                return Ok(());
            }
        }
        info!(mesh = %name, cluster = %self.ctx.cluster, "recording mesh");
        self.ctx.records.meshes.upsert(&desired).await?;
        Ok(())
    }

    #[instrument(skip(self, deployment), fields(cluster = %self.ctx.cluster))]
    pub async fn discover(&self, deployment: &Deployment) -> Result<()> {
        match self.scan(deployment)? {
            Some(mesh) => self.apply(mesh).await,
            None => Ok(()),
        }
    }

    /// Rescans every Deployment of the cluster. Meshes this cluster no longer
    /// runs are only deleted when pruning is enabled.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster))]
    pub async fn resync(&self) -> Result<()> {
        let mut found = BTreeMap::new();
        for deployment in self.deployments.state() {
            if let Some(mesh) = self.scan(&deployment)? {
                found.insert(mesh.name_any(), mesh);
            }
        }
        for mesh in found.values() {
            self.apply(mesh.clone()).await?;
        }

        if !self.ctx.prune_meshes {
            debug!("mesh pruning disabled");
            return Ok(());
        }
        let selector = labels::discovered_on(labels::MESH_DISCOVERY, &self.ctx.cluster);
        for mesh in self.ctx.records.meshes.list(&selector).await? {
            let name = mesh.name_any();
            if !found.contains_key(&name) {
                info!(mesh = %name, "pruning mesh no longer found on cluster");
                self.ctx.records.meshes.delete(&name).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Deployment> for MeshFinder {
    async fn on_create(&self, obj: Arc<Deployment>) -> Result<(), HandlerError> {
        Ok(self.discover(&obj).await?)
    }

    async fn on_update(&self, _old: Arc<Deployment>, new: Arc<Deployment>) -> Result<(), HandlerError> {
        Ok(self.discover(&new).await?)
    }

    async fn on_delete(&self, _obj: Arc<Deployment>) -> Result<(), HandlerError> {
        Ok(self.resync().await?)
    }
}
