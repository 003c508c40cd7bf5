use std::collections::BTreeMap;

use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

use crate::v1alpha1::ResourceRef;

pub const NAME_GROUP_MESHWORKLOAD: &str = "meshworkloads.discovery.mesh-hub.dev";

/// A workload controller whose pods were found running a mesh sidecar.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "discovery.mesh-hub.dev",
    version = "v1alpha1",
    kind = "MeshWorkload",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshWorkloadSpec {
    pub kube_controller: KubeController,
    pub mesh: ResourceRef,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct KubeController {
    pub kube_controller_ref: ResourceRef,
    /// Pod template labels of the controller
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub service_account_name: String,
}

impl MeshWorkload {
    pub fn controller_namespace(&self) -> Option<&str> {
        self.spec
            .kube_controller
            .kube_controller_ref
            .namespace
            .as_deref()
    }
}
