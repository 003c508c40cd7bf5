use kube::CustomResource;
use kube::KubeSchema;
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_KUBERNETESCLUSTER: &str = "kubernetesclusters.multicluster.mesh-hub.dev";

pub const DEFAULT_KUBECONFIG_KEY: &str = "kubeconfig";

/// A remote cluster to federate. The kubeconfig is read from a Secret in the
/// same namespace.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "multicluster.mesh-hub.dev",
    version = "v1alpha1",
    kind = "KubernetesCluster",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClusterSpec {
    /// Name of the Secret storing the kubeconfig for the cluster
    pub secret_name: String,
    /// Key within the Secret, defaults to `kubeconfig`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Kubeconfig context to use, defaults to the current context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl KubernetesClusterSpec {
    pub fn secret_key(&self) -> &str {
        self.secret_key.as_deref().unwrap_or(DEFAULT_KUBECONFIG_KEY)
    }
}
