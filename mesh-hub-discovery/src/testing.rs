use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::Uri;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::ObjectMeta;
use kube::config::Config;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use mesh_hub_crds::labels;
use mesh_hub_crds::names;
use mesh_hub_crds::v1alpha1::ResourceRef;
use mesh_hub_crds::v1alpha1::mesh::{
    AwsAppMesh, IstioMesh, Mesh, MeshInstallation, MeshSpec, MeshType,
};
use mesh_hub_crds::v1alpha1::mesh_service::{KubeService, MeshService, MeshServiceSpec};
use mesh_hub_crds::v1alpha1::mesh_workload::{KubeController, MeshWorkload, MeshWorkloadSpec};
use mesh_hub_k8s_utils::event::Dispatcher;
use mesh_hub_k8s_utils::{Event, EventFeed, EventHandler, HandlerId, Predicate, RecordStore};

use crate::context::{DiscoveryContext, Records};
use crate::scanner::Scanners;

pub const NAMESPACE: &str = "mesh-hub";

pub fn test_client() -> Client {
    let config = Config::new(Uri::from_static("http://localhost"));
    mesh_hub_multicluster::cluster_client(config, "test").expect("test client")
}

struct Inner<K> {
    objects: BTreeMap<String, K>,
    writes: usize,
    deletes: usize,
}

/// Record store kept in memory that counts the writes it receives.
pub struct MemoryRecordStore<K> {
    inner: Arc<Mutex<Inner<K>>>,
    lists: Arc<AtomicUsize>,
}

impl<K> Clone for MemoryRecordStore<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            lists: self.lists.clone(),
        }
    }
}

impl<K> Default for MemoryRecordStore<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                writes: 0,
                deletes: 0,
            })),
            lists: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K: Resource + Clone> MemoryRecordStore<K> {
    /// Seeds an object without counting a write.
    pub fn insert(&self, obj: K) {
        let name = obj.name_any();
        self.inner.lock().unwrap().objects.insert(name, obj);
    }

    /// Drops an object without counting a write.
    pub fn remove(&self, name: &str) {
        self.inner.lock().unwrap().objects.remove(name);
    }

    pub fn stored(&self, name: &str) -> Option<K> {
        self.inner.lock().unwrap().objects.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn writes(&self) -> usize {
        self.inner.lock().unwrap().writes
    }

    pub fn deletes(&self) -> usize {
        self.inner.lock().unwrap().deletes
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn write(&self, obj: &K) -> K {
        let mut inner = self.inner.lock().unwrap();
        inner.writes += 1;
        inner.objects.insert(obj.name_any(), obj.clone());
        obj.clone()
    }
}

#[async_trait]
impl<K> RecordStore<K> for MemoryRecordStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> mesh_hub_k8s_utils::Result<Option<K>> {
        Ok(self.stored(name))
    }

    async fn list(&self, selector: &BTreeMap<String, String>) -> mesh_hub_k8s_utils::Result<Vec<K>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .values()
            .filter(|obj| selector.iter().all(|(k, v)| obj.labels().get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> mesh_hub_k8s_utils::Result<K> {
        Ok(self.write(obj))
    }

    async fn update(&self, obj: &K) -> mesh_hub_k8s_utils::Result<K> {
        Ok(self.write(obj))
    }

    async fn delete(&self, name: &str) -> mesh_hub_k8s_utils::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.remove(name).is_some() {
            inner.writes += 1;
            inner.deletes += 1;
        }
        Ok(())
    }

    async fn upsert(&self, obj: &K) -> mesh_hub_k8s_utils::Result<K> {
        Ok(self.write(obj))
    }
}

/// Feed driven directly by the test.
pub struct TestFeed<K: Send + Sync + 'static> {
    dispatcher: Dispatcher<K>,
}

impl<K: Send + Sync + 'static> Default for TestFeed<K> {
    fn default() -> Self {
        Self {
            dispatcher: Dispatcher::new("test"),
        }
    }
}

impl<K: Send + Sync + 'static> TestFeed<K> {
    pub async fn send(&self, event: Event<K>) {
        self.dispatcher.dispatch(&event).await;
    }

    pub fn handlers(&self) -> usize {
        self.dispatcher.len()
    }
}

impl<K: Send + Sync + 'static> EventFeed<K> for TestFeed<K> {
    fn add_event_handler(
        &self,
        handler: Arc<dyn EventHandler<K>>,
        predicates: Vec<Predicate<K>>,
    ) -> mesh_hub_k8s_utils::Result<HandlerId> {
        self.dispatcher.register(handler, predicates)
    }

    fn remove_event_handler(&self, id: HandlerId) -> mesh_hub_k8s_utils::Result<()> {
        self.dispatcher.deregister(id)
    }
}

fn label_map(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn meta(name: &str, namespace: &str, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: (!labels.is_empty()).then(|| label_map(labels)),
        uid: Some(format!("{namespace}-{name}-uid")),
        ..Default::default()
    }
}

fn controller_ref(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".into(),
        kind: kind.into(),
        name: name.into(),
        uid: format!("{name}-uid"),
        controller: Some(true),
        ..Default::default()
    }
}

pub fn store_of<K>(objects: Vec<K>) -> Store<K>
where
    K: kube::runtime::reflector::Lookup + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Default,
{
    let (reader, mut writer) = reflector::store();
    for obj in objects {
        writer.apply_watcher_event(&watcher::Event::Apply(obj));
    }
    reader
}

pub fn container(name: &str, image: &str) -> Container {
    Container {
        name: name.into(),
        image: Some(image.into()),
        ..Default::default()
    }
}

pub fn make_pod(
    name: &str,
    namespace: &str,
    labels: &[(&str, &str)],
    containers: Vec<Container>,
) -> Pod {
    Pod {
        metadata: meta(name, namespace, labels),
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn owned_by(mut pod: Pod, kind: &str, name: &str) -> Pod {
    pod.metadata.owner_references = Some(vec![controller_ref(kind, name)]);
    pod
}

/// Pod with an Istio sidecar, owned by `replicaset` unless it is empty.
pub fn injected_pod(
    name: &str,
    namespace: &str,
    replicaset: &str,
    labels: &[(&str, &str)],
) -> Pod {
    let mut pod = make_pod(
        name,
        namespace,
        labels,
        vec![
            container("app", "example/app:v1"),
            container("istio-proxy", "docker.io/istio/proxyv2:1.5.1"),
        ],
    );
    if let Some(spec) = pod.spec.as_mut() {
        spec.service_account_name = Some("reviews".into());
    }
    if replicaset.is_empty() {
        return pod;
    }
    owned_by(pod, "ReplicaSet", replicaset)
}

/// Pod with an App Mesh envoy configured for `virtual_node`.
pub fn envoy_pod(name: &str, namespace: &str, virtual_node: &str) -> Pod {
    let mut envoy = container(
        "envoy",
        "840364872350.dkr.ecr.us-west-2.amazonaws.com/aws-appmesh-envoy:v1.15.0.0-prod",
    );
    envoy.env = Some(vec![EnvVar {
        name: "APPMESH_VIRTUAL_NODE_NAME".into(),
        value: Some(virtual_node.into()),
        ..Default::default()
    }]);
    make_pod(name, namespace, &[], vec![container("app", "example/app:v1"), envoy])
}

pub fn make_deployment(
    name: &str,
    namespace: &str,
    labels: &[(&str, &str)],
    containers: Vec<Container>,
) -> Deployment {
    Deployment {
        metadata: meta(name, namespace, &[]),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(label_map(labels)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(label_map(labels)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn replicaset_for(deployment: &Deployment, name: &str) -> ReplicaSet {
    let namespace = deployment.namespace().unwrap_or_default();
    let mut metadata = meta(name, &namespace, &[]);
    metadata.owner_references = Some(vec![controller_ref("Deployment", &deployment.name_any())]);
    ReplicaSet {
        metadata,
        spec: Some(ReplicaSetSpec {
            selector: deployment
                .spec
                .as_ref()
                .map(|s| s.selector.clone())
                .unwrap_or_default(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn make_service(
    name: &str,
    namespace: &str,
    selector: &[(&str, &str)],
    ports: &[(&str, i32)],
) -> Service {
    Service {
        metadata: meta(name, namespace, &[]),
        spec: Some(ServiceSpec {
            selector: (!selector.is_empty()).then(|| label_map(selector)),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mesh_record(name: &str, spec: MeshSpec) -> Mesh {
    let mut mesh = Mesh::new(name, spec);
    mesh.metadata.namespace = Some(NAMESPACE.into());
    mesh
}

pub fn istio_mesh_name(cluster: &str) -> String {
    names::cluster_local_mesh_name(MeshType::Istio, "istio-system", cluster)
}

pub fn app_mesh_name(name: &str, region: &str, account: &str) -> String {
    names::account_scoped_mesh_name(MeshType::AppMesh, name, region, account)
}

/// Istio installed in istio-system on `cluster`, as mesh discovery records it.
pub fn istio_mesh(cluster: &str) -> Mesh {
    let mut mesh = mesh_record(
        &istio_mesh_name(cluster),
        MeshSpec {
            istio: Some(IstioMesh {
                installation: MeshInstallation {
                    installation_namespace: "istio-system".into(),
                    version: "1.5.1".into(),
                },
                ..Default::default()
            }),
            cluster: Some(ResourceRef::new(cluster)),
            ..Default::default()
        },
    );
    mesh.metadata.labels = Some(labels::mesh_labels(MeshType::Istio, Some(cluster)));
    mesh
}

pub fn app_mesh(name: &str, region: &str, account: &str, clusters: &[&str]) -> Mesh {
    let mut mesh = mesh_record(
        &app_mesh_name(name, region, account),
        MeshSpec {
            aws_app_mesh: Some(AwsAppMesh {
                name: name.into(),
                region: region.into(),
                aws_account_id: account.into(),
                clusters: clusters.iter().map(|c| c.to_string()).collect(),
            }),
            ..Default::default()
        },
    );
    mesh.metadata.labels = Some(labels::mesh_labels(MeshType::AppMesh, None));
    mesh
}

/// MeshWorkload for Deployment `name` in `namespace` on `cluster`, backed by
/// the east Istio mesh.
pub fn workload_record(
    name: &str,
    namespace: &str,
    cluster: &str,
    pod_labels: &[(&str, &str)],
) -> MeshWorkload {
    let mut workload = MeshWorkload::new(
        name,
        MeshWorkloadSpec {
            kube_controller: KubeController {
                kube_controller_ref: ResourceRef::new(name).within(namespace).on_cluster(cluster),
                labels: label_map(pod_labels),
                service_account_name: "default".into(),
            },
            mesh: ResourceRef::new(istio_mesh_name("east")).within(NAMESPACE),
        },
    );
    workload.metadata.namespace = Some(NAMESPACE.into());
    workload.metadata.labels = Some(labels::workload_labels(
        cluster,
        MeshType::Istio,
        name,
        namespace,
    ));
    workload
}

pub fn service_record(name: &str, namespace: &str, cluster: &str) -> MeshService {
    let mut service = MeshService::new(
        &names::service_name(name, namespace, cluster),
        MeshServiceSpec {
            kube_service: KubeService {
                service_ref: ResourceRef::new(name).within(namespace).on_cluster(cluster),
                ..Default::default()
            },
            mesh: ResourceRef::new(istio_mesh_name("east")).within(NAMESPACE),
            ..Default::default()
        },
    );
    service.metadata.namespace = Some(NAMESPACE.into());
    service.metadata.labels = Some(labels::service_labels(cluster, name, namespace));
    service
}

pub fn context(
    cluster: &str,
    meshes: MemoryRecordStore<Mesh>,
    workloads: MemoryRecordStore<MeshWorkload>,
    services: MemoryRecordStore<MeshService>,
) -> Arc<DiscoveryContext> {
    Arc::new(DiscoveryContext {
        cluster: cluster.into(),
        namespace: NAMESPACE.into(),
        records: Records {
            meshes: Arc::new(meshes),
            workloads: Arc::new(workloads),
            services: Arc::new(services),
        },
        scanners: Arc::new(Scanners::builtin()),
        prune_meshes: false,
    })
}
