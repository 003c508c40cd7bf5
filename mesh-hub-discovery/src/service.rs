use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};
use mesh_hub_crds::labels;
use mesh_hub_crds::names;
use mesh_hub_crds::v1alpha1::ResourceRef;
use mesh_hub_crds::v1alpha1::mesh_service::{
    KubeService, KubeServicePort, MeshService, MeshServiceSpec, Subset,
};
use mesh_hub_crds::v1alpha1::mesh_workload::MeshWorkload;
use mesh_hub_k8s_utils::selector::is_generated_label;
use mesh_hub_k8s_utils::{
    EventFeed, EventHandler, HandlerError, HandlerId, Predicate, labels_match_selector,
};
use tracing::{info, instrument};

use crate::context::DiscoveryContext;
use crate::{Result, labels_cover};

const DEFAULT_PROTOCOL: &str = "TCP";

/// Label keys that take two or more distinct values across `workloads`,
/// with their sorted values. Generated pod labels are ignored.
pub fn compute_subsets<'a>(
    workloads: impl IntoIterator<Item = &'a MeshWorkload>,
) -> BTreeMap<String, Subset> {
    let mut values: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for workload in workloads {
        for (key, value) in &workload.spec.kube_controller.labels {
            if is_generated_label(key) {
                continue;
            }
            values
                .entry(key.as_str())
                .or_default()
                .insert(value.as_str());
        }
    }
    values
        .into_iter()
        .filter(|(_, v)| v.len() >= 2)
        .map(|(k, v)| {
            let subset = Subset {
                values: v.into_iter().map(str::to_string).collect(),
            };
            (k.to_string(), subset)
        })
        .collect()
}

fn selector(service: &Service) -> BTreeMap<String, String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.clone())
        .unwrap_or_default()
}

/// Whether `service` selects `workload`: same namespace and a non-empty
/// selector matching the workload's pod labels.
fn selects(service: &Service, workload: &MeshWorkload) -> bool {
    service.namespace().as_deref() == workload.controller_namespace()
        && labels_match_selector(&selector(service), &workload.spec.kube_controller.labels)
}

fn ports(service: &Service) -> Vec<KubeServicePort> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .map(|p| KubeServicePort {
            port: u32::try_from(p.port).unwrap_or_default(),
            name: p.name.clone().unwrap_or_default(),
            protocol: p
                .protocol
                .clone()
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        })
        .collect()
}

/// Keeps one MeshService per Service of a cluster that selects at least one
/// of the cluster's MeshWorkloads.
pub struct MeshServiceFinder {
    ctx: Arc<DiscoveryContext>,
    services: Store<Service>,
}

impl MeshServiceFinder {
    pub fn new(ctx: Arc<DiscoveryContext>, services: Store<Service>) -> Self {
        Self { ctx, services }
    }

    /// Registers for the cluster's Service events and for MeshWorkload
    /// events of this cluster. The returned id belongs to the workload feed.
    pub fn start_discovery(
        self: &Arc<Self>,
        services: &dyn EventFeed<Service>,
        workloads: &dyn EventFeed<MeshWorkload>,
    ) -> Result<HandlerId> {
        services.add_event_handler(self.clone(), vec![])?;
        let cluster = self.ctx.cluster.clone();
        let on_cluster: Predicate<MeshWorkload> = Arc::new(move |workload: &MeshWorkload| {
            labels::cluster_of(workload.labels()) == Some(cluster.as_str())
        });
        Ok(workloads.add_event_handler(self.clone(), vec![on_cluster])?)
    }

    async fn cluster_workloads(&self) -> Result<Vec<MeshWorkload>> {
        let selector = labels::discovered_on(labels::MESH_WORKLOAD_DISCOVERY, &self.ctx.cluster);
        let mut workloads = self.ctx.records.workloads.list(&selector).await?;
        workloads.sort_by_key(|w| w.name_any());
        Ok(workloads)
    }

    fn record_name(&self, service_name: &str, namespace: &str) -> String {
        names::service_name(service_name, namespace, &self.ctx.cluster)
    }

    /// The MeshService implied by `service`, or `None` when no workload
    /// backs it.
    fn desired(&self, service: &Service, workloads: &[MeshWorkload]) -> Option<MeshService> {
        let backing: Vec<&MeshWorkload> = workloads.iter().filter(|w| selects(service, w)).collect();
        let first = backing.first()?;
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_default();
        let cluster = &self.ctx.cluster;

        Some(MeshService {
            metadata: ObjectMeta {
                name: Some(self.record_name(&name, &namespace)),
                namespace: Some(self.ctx.namespace.clone()),
                labels: Some(labels::service_labels(cluster, &name, &namespace)),
                ..Default::default()
            },
            spec: MeshServiceSpec {
                kube_service: KubeService {
                    service_ref: ResourceRef::new(name)
                        .within(namespace)
                        .on_cluster(cluster.as_str()),
                    workload_selector_labels: selector(service),
                    labels: service.labels().clone(),
                    ports: ports(service),
                },
                mesh: first.spec.mesh.clone(),
                subsets: compute_subsets(backing.iter().copied()),
            },
        })
    }

    async fn reconcile_service(&self, service: &Service, workloads: &[MeshWorkload]) -> Result<()> {
        let name = self.record_name(&service.name_any(), &service.namespace().unwrap_or_default());
        let existing = self.ctx.records.services.get(&name).await?;
        match (self.desired(service, workloads), existing) {
            (Some(desired), Some(existing))
                if existing.spec == desired.spec
                    && labels_cover(existing.labels(), desired.labels()) => {}
            (Some(desired), _) => {
                info!(service = %name, "recording mesh service");
                self.ctx.records.services.upsert(&desired).await?;
            }
            (None, Some(_)) => {
                info!(service = %name, "mesh service has no backing workloads");
                self.ctx.records.services.delete(&name).await?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    #[instrument(skip(self, service), fields(cluster = %self.ctx.cluster, service = %service.name_any()))]
    pub async fn service_upserted(&self, service: &Service) -> Result<()> {
        let workloads = self.cluster_workloads().await?;
        self.reconcile_service(service, &workloads).await
    }

    #[instrument(skip(self, service), fields(cluster = %self.ctx.cluster, service = %service.name_any()))]
    pub async fn service_deleted(&self, service: &Service) -> Result<()> {
        let name = self.record_name(&service.name_any(), &service.namespace().unwrap_or_default());
        Ok(self.ctx.records.services.delete(&name).await?)
    }

    /// Recomputes every live Service selecting any of `changed`.
    #[instrument(skip(self, changed), fields(cluster = %self.ctx.cluster))]
    pub async fn workloads_upserted(&self, changed: &[&MeshWorkload]) -> Result<()> {
        let affected: Vec<Arc<Service>> = self
            .services
            .state()
            .into_iter()
            .filter(|s| changed.iter().any(|w| selects(s, w)))
            .collect();
        if affected.is_empty() {
            return Ok(());
        }
        let workloads = self.cluster_workloads().await?;
        for service in affected {
            self.reconcile_service(&service, &workloads).await?;
        }
        Ok(())
    }

    /// Deletes MeshServices whose Service is gone or no longer selects any
    /// live workload.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster))]
    pub async fn workload_deleted(&self) -> Result<()> {
        let workloads = self.cluster_workloads().await?;
        let selector = labels::discovered_on(labels::MESH_SERVICE_DISCOVERY, &self.ctx.cluster);
        for record in self.ctx.records.services.list(&selector).await? {
            let service_ref = &record.spec.kube_service.service_ref;
            let mut key = ObjectRef::new(&service_ref.name);
            if let Some(namespace) = &service_ref.namespace {
                key = key.within(namespace);
            }
            let orphaned = match self.services.get(&key) {
                None => true,
                Some(service) => !workloads.iter().any(|w| selects(&service, w)),
            };
            if orphaned {
                info!(service = %record.name_any(), "removing orphaned mesh service");
                self.ctx.records.services.delete(&record.name_any()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Service> for MeshServiceFinder {
    async fn on_create(&self, obj: Arc<Service>) -> Result<(), HandlerError> {
        Ok(self.service_upserted(&obj).await?)
    }

    async fn on_update(&self, _old: Arc<Service>, new: Arc<Service>) -> Result<(), HandlerError> {
        Ok(self.service_upserted(&new).await?)
    }

    async fn on_delete(&self, obj: Arc<Service>) -> Result<(), HandlerError> {
        Ok(self.service_deleted(&obj).await?)
    }
}

#[async_trait]
impl EventHandler<MeshWorkload> for MeshServiceFinder {
    async fn on_create(&self, obj: Arc<MeshWorkload>) -> Result<(), HandlerError> {
        Ok(self.workloads_upserted(&[obj.as_ref()]).await?)
    }

    // a Service the old labels matched must be recomputed as well
    async fn on_update(
        &self,
        old: Arc<MeshWorkload>,
        new: Arc<MeshWorkload>,
    ) -> Result<(), HandlerError> {
        Ok(self
            .workloads_upserted(&[old.as_ref(), new.as_ref()])
            .await?)
    }

    async fn on_delete(&self, _obj: Arc<MeshWorkload>) -> Result<(), HandlerError> {
        Ok(self.workload_deleted().await?)
    }
}
