use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("in-cluster config error: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("crd error: {0}")]
    Crds(#[from] mesh_hub_crds::Error),

    #[error("multicluster error: {0}")]
    Multicluster(#[from] mesh_hub_multicluster::Error),

    #[error("management cluster failed: {0}")]
    LocalCluster(Arc<mesh_hub_multicluster::Error>),

    #[error("invalid endpoint {endpoint} for cluster {cluster}")]
    InvalidEndpoint { cluster: String, endpoint: String },
}
