use std::collections::BTreeMap;

use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

use crate::v1alpha1::ResourceRef;

pub const NAME_GROUP_MESHSERVICE: &str = "meshservices.discovery.mesh-hub.dev";

/// A Kubernetes Service together with the mesh workloads it selects.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "discovery.mesh-hub.dev",
    version = "v1alpha1",
    kind = "MeshService",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshServiceSpec {
    pub kube_service: KubeService,
    pub mesh: ResourceRef,
    /// Label keys taking two or more distinct values across the backing workloads
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subsets: BTreeMap<String, Subset>,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct KubeService {
    #[serde(rename = "ref")]
    pub service_ref: ResourceRef,
    #[serde(default)]
    pub workload_selector_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<KubeServicePort>,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
pub struct KubeServicePort {
    pub port: u32,
    pub name: String,
    pub protocol: String,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
pub struct Subset {
    pub values: Vec<String>,
}
