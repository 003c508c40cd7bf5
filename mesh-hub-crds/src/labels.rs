//! Discovery label vocabulary attached to every record produced by discovery.
//!
//! Other subsystems select records through these labels, so the keys and
//! values here are a compatibility contract.

use std::collections::BTreeMap;

use crate::v1alpha1::mesh::MeshType;

pub const DISCOVERED_BY: &str = "discovery.mesh-hub.dev/discovered-by";
pub const CLUSTER: &str = "discovery.mesh-hub.dev/cluster";
pub const MESH_TYPE: &str = "discovery.mesh-hub.dev/mesh-type";
pub const CONTROLLER_NAME: &str = "discovery.mesh-hub.dev/controller-name";
pub const CONTROLLER_NAMESPACE: &str = "discovery.mesh-hub.dev/controller-namespace";
pub const SERVICE_NAME: &str = "discovery.mesh-hub.dev/service-name";
pub const SERVICE_NAMESPACE: &str = "discovery.mesh-hub.dev/service-namespace";

pub const MESH_DISCOVERY: &str = "mesh-discovery";
pub const MESH_WORKLOAD_DISCOVERY: &str = "mesh-workload-discovery";
pub const MESH_SERVICE_DISCOVERY: &str = "mesh-service-discovery";

/// Labels selecting every record a discovery subsystem produced for a cluster.
pub fn discovered_on(discovered_by: &str, cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (DISCOVERED_BY.to_string(), discovered_by.to_string()),
        (CLUSTER.to_string(), cluster.to_string()),
    ])
}

/// Cluster-local meshes are labelled with their cluster, account-scoped
/// meshes are not since they span clusters.
pub fn mesh_labels(mesh_type: MeshType, cluster: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (DISCOVERED_BY.to_string(), MESH_DISCOVERY.to_string()),
        (MESH_TYPE.to_string(), mesh_type.to_string()),
    ]);
    if let Some(cluster) = cluster {
        labels.insert(CLUSTER.to_string(), cluster.to_string());
    }
    labels
}

pub fn account_scoped_meshes(mesh_type: MeshType) -> BTreeMap<String, String> {
    mesh_labels(mesh_type, None)
}

pub fn workload_labels(
    cluster: &str,
    mesh_type: MeshType,
    controller_name: &str,
    controller_namespace: &str,
) -> BTreeMap<String, String> {
    let mut labels = discovered_on(MESH_WORKLOAD_DISCOVERY, cluster);
    labels.insert(MESH_TYPE.to_string(), mesh_type.to_string());
    labels.insert(CONTROLLER_NAME.to_string(), controller_name.to_string());
    labels.insert(
        CONTROLLER_NAMESPACE.to_string(),
        controller_namespace.to_string(),
    );
    labels
}

pub fn service_labels(
    cluster: &str,
    service_name: &str,
    service_namespace: &str,
) -> BTreeMap<String, String> {
    let mut labels = discovered_on(MESH_SERVICE_DISCOVERY, cluster);
    labels.insert(SERVICE_NAME.to_string(), service_name.to_string());
    labels.insert(SERVICE_NAMESPACE.to_string(), service_namespace.to_string());
    labels
}

pub fn cluster_of(labels: &BTreeMap<String, String>) -> Option<&str> {
    labels.get(CLUSTER).map(String::as_str)
}
