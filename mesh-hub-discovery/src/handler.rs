use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use kube::runtime::reflector;
use mesh_hub_crds::labels;
use mesh_hub_crds::v1alpha1::mesh::Mesh;
use mesh_hub_crds::v1alpha1::mesh_workload::MeshWorkload;
use mesh_hub_k8s_utils::{EventFeed, HandlerId};
use mesh_hub_multicluster::{AsyncManager, BoxError, ClusterHandler};
use tracing::{info, instrument, warn};

use crate::context::{DiscoveryContext, Records};
use crate::mesh::MeshFinder;
use crate::owner::OwnerResolver;
use crate::scanner::Scanners;
use crate::service::MeshServiceFinder;
use crate::tenancy::ClusterTenancyFinder;
use crate::workload::MeshWorkloadFinder;
use crate::Result;

/// Name the discovery handler is registered under with the manager controller
pub const DISCOVERY_HANDLER: &str = "mesh-discovery";

/// Handlers a cluster's finders hold on the management cluster's feeds.
/// Feeds of the cluster itself go away with its manager.
#[derive(Debug, Default)]
struct Registration {
    meshes: Vec<HandlerId>,
    workloads: Vec<HandlerId>,
}

/// Starts discovery on every cluster added to the manager controller and
/// cleans up after clusters that are removed.
pub struct DiscoveryHandler {
    local: Arc<AsyncManager>,
    namespace: String,
    records: Records,
    scanners: Arc<Scanners>,
    prune_meshes: bool,
    registrations: DashMap<String, Registration>,
}

impl DiscoveryHandler {
    /// Records are written through `local`'s client into `namespace`.
    pub fn new(local: Arc<AsyncManager>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            records: Records::kube(local.client(), &namespace),
            local,
            namespace,
            scanners: Arc::new(Scanners::builtin()),
            prune_meshes: false,
            registrations: DashMap::new(),
        }
    }

    pub fn with_records(mut self, records: Records) -> Self {
        self.records = records;
        self
    }

    pub fn with_scanners(mut self, scanners: Arc<Scanners>) -> Self {
        self.scanners = scanners;
        self
    }

    pub fn with_prune_meshes(mut self, prune_meshes: bool) -> Self {
        self.prune_meshes = prune_meshes;
        self
    }

    pub fn clusters(&self) -> Vec<String> {
        let mut clusters: Vec<String> = self.registrations.iter().map(|r| r.key().clone()).collect();
        clusters.sort();
        clusters
    }

    fn context(&self, cluster: &str) -> Arc<DiscoveryContext> {
        Arc::new(DiscoveryContext {
            cluster: cluster.to_string(),
            namespace: self.namespace.clone(),
            records: self.records.clone(),
            scanners: self.scanners.clone(),
            prune_meshes: self.prune_meshes,
        })
    }

    async fn start(
        &self,
        manager: &AsyncManager,
        cluster: &str,
        registration: &mut Registration,
    ) -> Result<()> {
        let pods = manager.watch::<Pod>();
        let services = manager.watch::<Service>();
        let deployments = manager.watch::<Deployment>();
        let replicasets = manager.watch::<ReplicaSet>();
        manager.wait_for_cache_sync().await?;

        let meshes = self.local.watch_namespaced::<Mesh>(&self.namespace);
        let workloads = self.local.watch_namespaced::<MeshWorkload>(&self.namespace);
        self.local.wait_for_cache_sync().await?;

        let ctx = self.context(cluster);

        let mesh_finder = Arc::new(MeshFinder::new(ctx.clone(), deployments.store()));
        mesh_finder.start_discovery(deployments.as_ref())?;

        let owners = OwnerResolver::new(replicasets.store(), deployments.store());
        let workload_finder = Arc::new(MeshWorkloadFinder::new(ctx.clone(), pods.store(), owners));
        registration
            .meshes
            .push(workload_finder.start_discovery(pods.as_ref(), meshes.as_ref())?);

        let service_finder = Arc::new(MeshServiceFinder::new(ctx.clone(), services.store()));
        registration
            .workloads
            .push(service_finder.start_discovery(services.as_ref(), workloads.as_ref())?);

        let tenancy = Arc::new(ClusterTenancyFinder::new(ctx, pods.store()));
        registration
            .meshes
            .push(tenancy.start_discovery(pods.as_ref(), meshes.as_ref())?);
        Ok(())
    }

    /// Drops the cluster's handlers from the management feeds.
    fn release(&self, cluster: &str, registration: &Registration) {
        let meshes = self.local.watch_namespaced::<Mesh>(&self.namespace);
        for id in &registration.meshes {
            if let Err(error) = meshes.remove_event_handler(*id) {
                warn!(%cluster, handler = %id, %error, "failed to remove mesh handler");
            }
        }
        let workloads = self.local.watch_namespaced::<MeshWorkload>(&self.namespace);
        for id in &registration.workloads {
            if let Err(error) = workloads.remove_event_handler(*id) {
                warn!(%cluster, handler = %id, %error, "failed to remove workload handler");
            }
        }
    }

    /// Deletes the records discovered on `cluster` and takes it out of every
    /// account-scoped mesh.
    #[instrument(skip(self))]
    async fn remove_records(&self, cluster: &str) -> Result<()> {
        let selector = labels::discovered_on(labels::MESH_SERVICE_DISCOVERY, cluster);
        for service in self.records.services.list(&selector).await? {
            self.records.services.delete(&service.name_any()).await?;
        }
        let selector = labels::discovered_on(labels::MESH_WORKLOAD_DISCOVERY, cluster);
        for workload in self.records.workloads.list(&selector).await? {
            self.records.workloads.delete(&workload.name_any()).await?;
        }
        if self.prune_meshes {
            let selector = labels::discovered_on(labels::MESH_DISCOVERY, cluster);
            for mesh in self.records.meshes.list(&selector).await? {
                self.records.meshes.delete(&mesh.name_any()).await?;
            }
        }

        let (pods, _) = reflector::store::<Pod>();
        ClusterTenancyFinder::new(self.context(cluster), pods)
            .deregister_all()
            .await
    }
}

#[async_trait]
impl ClusterHandler for DiscoveryHandler {
    async fn cluster_added(
        &self,
        manager: Arc<AsyncManager>,
        cluster: &str,
    ) -> Result<(), BoxError> {
        let mut registration = Registration::default();
        if let Err(error) = self.start(&manager, cluster, &mut registration).await {
            self.release(cluster, &registration);
            return Err(error.into());
        }
        if let Some(previous) = self.registrations.insert(cluster.to_string(), registration) {
            self.release(cluster, &previous);
        }
        info!(%cluster, "discovery started");
        Ok(())
    }

    async fn cluster_removed(&self, cluster: &str) -> Result<(), BoxError> {
        if let Some((_, registration)) = self.registrations.remove(cluster) {
            self.release(cluster, &registration);
        }
        self.remove_records(cluster).await?;
        info!(%cluster, "discovery stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mesh_hub_crds::names;
    use mesh_hub_crds::v1alpha1::mesh_service::MeshService;

    use super::*;
    use crate::testing::{
        MemoryRecordStore, TestFeed, app_mesh, app_mesh_name, istio_mesh, istio_mesh_name,
        service_record, test_client, workload_record,
    };

    struct Fixture {
        meshes: MemoryRecordStore<Mesh>,
        workloads: MemoryRecordStore<MeshWorkload>,
        services: MemoryRecordStore<MeshService>,
        local: Arc<AsyncManager>,
        handler: DiscoveryHandler,
    }

    fn fixture(prune_meshes: bool) -> Fixture {
        let meshes = MemoryRecordStore::default();
        let workloads = MemoryRecordStore::default();
        let services = MemoryRecordStore::default();
        let local = Arc::new(AsyncManager::new("local", test_client()));
        let records = Records {
            meshes: Arc::new(meshes.clone()),
            workloads: Arc::new(workloads.clone()),
            services: Arc::new(services.clone()),
        };
        let handler = DiscoveryHandler::new(local.clone(), "mesh-hub")
            .with_records(records)
            .with_prune_meshes(prune_meshes);
        Fixture {
            meshes,
            workloads,
            services,
            local,
            handler,
        }
    }

    #[tokio::test]
    async fn test_removal_deletes_cluster_records() {
        let f = fixture(false);
        f.workloads
            .insert(workload_record("w-east", "default", "east", &[("app", "x")]));
        f.workloads
            .insert(workload_record("w-west", "default", "west", &[("app", "x")]));
        f.services.insert(service_record("svc1", "default", "east"));
        f.services.insert(service_record("svc1", "default", "west"));
        f.meshes.insert(istio_mesh("east"));

        f.handler.cluster_removed("east").await.expect("removed");

        assert!(f.workloads.stored("w-east").is_none());
        assert!(f.workloads.stored("w-west").is_some());
        assert!(f.services.stored(&names::service_name("svc1", "default", "east")).is_none());
        assert!(f.services.stored(&names::service_name("svc1", "default", "west")).is_some());
        // meshes are kept unless pruning is enabled
        assert!(f.meshes.stored(&istio_mesh_name("east")).is_some());
    }

    #[tokio::test]
    async fn test_removal_prunes_meshes_when_enabled() {
        let f = fixture(true);
        f.meshes.insert(istio_mesh("east"));
        f.meshes.insert(istio_mesh("west"));

        f.handler.cluster_removed("east").await.expect("removed");

        assert!(f.meshes.stored(&istio_mesh_name("east")).is_none());
        assert!(f.meshes.stored(&istio_mesh_name("west")).is_some());
    }

    #[tokio::test]
    async fn test_removal_leaves_account_scoped_meshes() {
        let f = fixture(false);
        f.meshes
            .insert(app_mesh("shop", "us-east-1", "123456789012", &["east", "west"]));

        f.handler.cluster_removed("east").await.expect("removed");

        let mesh = f
            .meshes
            .stored(&app_mesh_name("shop", "us-east-1", "123456789012"))
            .expect("mesh kept");
        assert_eq!(mesh.spec.aws_app_mesh.expect("appmesh").clusters, vec!["west"]);
    }

    #[tokio::test]
    async fn test_removal_releases_management_handlers() {
        let f = fixture(false);
        let meshes = f.local.watch_namespaced::<Mesh>("mesh-hub");
        let workloads = f.local.watch_namespaced::<MeshWorkload>("mesh-hub");

        let ctx = f.handler.context("east");
        let pods = TestFeed::<Pod>::default();
        let services = TestFeed::<Service>::default();
        let (pod_store, _) = reflector::store::<Pod>();
        let (service_store, _) = reflector::store::<Service>();
        let tenancy = Arc::new(ClusterTenancyFinder::new(ctx.clone(), pod_store));
        let service_finder = Arc::new(MeshServiceFinder::new(ctx, service_store));
        let registration = Registration {
            meshes: vec![tenancy.start_discovery(&pods, meshes.as_ref()).expect("tenancy")],
            workloads: vec![
                service_finder
                    .start_discovery(&services, workloads.as_ref())
                    .expect("services"),
            ],
        };
        f.handler
            .registrations
            .insert("east".to_string(), registration);
        assert_eq!(meshes.handler_count(), 1);
        assert_eq!(workloads.handler_count(), 1);

        f.handler.cluster_removed("east").await.expect("removed");

        assert_eq!(meshes.handler_count(), 0);
        assert_eq!(workloads.handler_count(), 0);
        assert!(f.handler.clusters().is_empty());
    }

    #[tokio::test]
    async fn test_removing_unknown_cluster_is_clean() {
        let f = fixture(false);
        f.handler.cluster_removed("nowhere").await.expect("removed");
        assert_eq!(f.workloads.writes(), 0);
        assert_eq!(f.services.writes(), 0);
        assert_eq!(f.meshes.writes(), 0);
    }
}
