use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::reflector::Store;
use mesh_hub_crds::labels;
use mesh_hub_crds::names;
use mesh_hub_crds::v1alpha1::ResourceRef;
use mesh_hub_crds::v1alpha1::mesh::Mesh;
use mesh_hub_crds::v1alpha1::mesh_workload::{KubeController, MeshWorkload, MeshWorkloadSpec};
use mesh_hub_k8s_utils::{
    EventFeed, EventHandler, HandlerError, HandlerId, Predicate, sanitize_pod_labels,
};
use tracing::{debug, info, instrument};

use crate::context::DiscoveryContext;
use crate::owner::OwnerResolver;
use crate::{Error, Result, labels_cover};

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Pod,
    Mesh,
}

/// Maintains the MeshWorkload records of one cluster. Every pod and mesh
/// event recomputes the full set from the live pods rather than patching it,
/// so missed or reordered events are repaired by the next pass.
pub struct MeshWorkloadFinder {
    ctx: Arc<DiscoveryContext>,
    pods: Store<Pod>,
    owners: OwnerResolver,
}

fn same_workload(existing: &MeshWorkload, desired: &MeshWorkload) -> bool {
    existing.spec == desired.spec && labels_cover(existing.labels(), desired.labels())
}

impl MeshWorkloadFinder {
    pub fn new(ctx: Arc<DiscoveryContext>, pods: Store<Pod>, owners: OwnerResolver) -> Self {
        Self { ctx, pods, owners }
    }

    /// Registers for the cluster's pod events and the management cluster's
    /// mesh events. The returned id belongs to the mesh feed.
    pub fn start_discovery(
        self: &Arc<Self>,
        pods: &dyn EventFeed<Pod>,
        meshes: &dyn EventFeed<Mesh>,
    ) -> Result<HandlerId> {
        pods.add_event_handler(self.clone(), vec![])?;
        let cluster = self.ctx.cluster.clone();
        let hosted: Predicate<Mesh> = Arc::new(move |mesh: &Mesh| mesh.spec.hosted_on(&cluster));
        Ok(meshes.add_event_handler(self.clone(), vec![hosted])?)
    }

    async fn hosted_meshes(&self) -> Result<Vec<Arc<Mesh>>> {
        let meshes = self.ctx.records.meshes.list(&BTreeMap::new()).await?;
        Ok(meshes
            .into_iter()
            .filter(|m| m.spec.hosted_on(&self.ctx.cluster))
            .map(Arc::new)
            .collect())
    }

    /// The MeshWorkload a pod implies, if it runs a sidecar of one of
    /// `meshes` and is controlled by a Deployment.
    fn discover(&self, pod: &Pod, meshes: &[Arc<Mesh>]) -> Result<Option<MeshWorkload>> {
        let Some(mesh) = self.ctx.scanners.scan_pod(pod, meshes)? else {
            return Ok(None);
        };
        let Some(mesh_type) = mesh.spec.mesh_type() else {
            return Err(Error::UntypedMesh);
        };
        let Some(deployment) = self.owners.deployment_for_pod(pod) else {
            debug!(pod = %pod.name_any(), "injected pod has no deployment");
            return Ok(None);
        };

        let controller = deployment.name_any();
        let namespace = deployment.namespace().unwrap_or_default();
        let cluster = &self.ctx.cluster;

        let mut template_labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        sanitize_pod_labels(&mut template_labels);

        let service_account = pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());

        let mut mesh_ref = ResourceRef::new(mesh.name_any());
        mesh_ref.namespace = mesh.namespace();

        Ok(Some(MeshWorkload {
            metadata: ObjectMeta {
                name: Some(names::workload_name(mesh_type, &controller, &namespace, cluster)),
                namespace: Some(self.ctx.namespace.clone()),
                labels: Some(labels::workload_labels(cluster, mesh_type, &controller, &namespace)),
                ..Default::default()
            },
            spec: MeshWorkloadSpec {
                kube_controller: KubeController {
                    kube_controller_ref: ResourceRef::new(controller)
                        .within(namespace)
                        .on_cluster(cluster.as_str()),
                    labels: template_labels,
                    service_account_name: service_account,
                },
                mesh: mesh_ref,
            },
        }))
    }

    async fn write(&self, existing: Option<&MeshWorkload>, desired: &MeshWorkload) -> Result<()> {
        if existing.is_some_and(|e| same_workload(e, desired)) {
            return Ok(());
        }
        info!(workload = %desired.name_any(), "recording mesh workload");
        self.ctx.records.workloads.upsert(desired).await?;
        Ok(())
    }

    /// Records the workload of a single pod ahead of the full pass.
    #[instrument(skip(self, pod), fields(cluster = %self.ctx.cluster, pod = %pod.name_any()))]
    async fn discover_pod(&self, pod: &Pod) -> Result<()> {
        let meshes = self.hosted_meshes().await?;
        let Some(desired) = self.discover(pod, &meshes)? else {
            return Ok(());
        };
        let existing = self.ctx.records.workloads.get(&desired.name_any()).await?;
        self.write(existing.as_ref(), &desired).await
    }

    /// Full reconciliation of the cluster's MeshWorkload records against the
    /// live pods. The first error aborts the pass.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster))]
    async fn reconcile(&self, trigger: Trigger) -> Result<()> {
        let selector = labels::discovered_on(labels::MESH_WORKLOAD_DISCOVERY, &self.ctx.cluster);
        let recorded = self.ctx.records.workloads.list(&selector).await?;
        if recorded.is_empty() && trigger == Trigger::Pod {
            return Ok(());
        }

        let meshes = self.hosted_meshes().await?;
        let mut discovered: BTreeMap<String, MeshWorkload> = BTreeMap::new();
        for pod in self.pods.state() {
            if let Some(workload) = self.discover(&pod, &meshes)? {
                discovered.entry(workload.name_any()).or_insert(workload);
            }
        }

        for record in recorded {
            let name = record.name_any();
            match discovered.remove(&name) {
                Some(desired) => self.write(Some(&record), &desired).await?,
                None => {
                    info!(workload = %name, "mesh workload no longer discovered");
                    self.ctx.records.workloads.delete(&name).await?;
                }
            }
        }
        for desired in discovered.into_values() {
            self.write(None, &desired).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Pod> for MeshWorkloadFinder {
    async fn on_create(&self, obj: Arc<Pod>) -> Result<(), HandlerError> {
        self.discover_pod(&obj).await?;
        Ok(self.reconcile(Trigger::Pod).await?)
    }

    async fn on_update(&self, _old: Arc<Pod>, new: Arc<Pod>) -> Result<(), HandlerError> {
        self.discover_pod(&new).await?;
        Ok(self.reconcile(Trigger::Pod).await?)
    }

    async fn on_delete(&self, _obj: Arc<Pod>) -> Result<(), HandlerError> {
        Ok(self.reconcile(Trigger::Pod).await?)
    }
}

#[async_trait]
impl EventHandler<Mesh> for MeshWorkloadFinder {
    async fn on_create(&self, _obj: Arc<Mesh>) -> Result<(), HandlerError> {
        Ok(self.reconcile(Trigger::Mesh).await?)
    }

    async fn on_update(&self, _old: Arc<Mesh>, _new: Arc<Mesh>) -> Result<(), HandlerError> {
        Ok(self.reconcile(Trigger::Mesh).await?)
    }

    async fn on_delete(&self, _obj: Arc<Mesh>) -> Result<(), HandlerError> {
        Ok(self.reconcile(Trigger::Mesh).await?)
    }
}
