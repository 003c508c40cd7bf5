use std::sync::Arc;

use thiserror::Error;

use crate::BoxError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("watch error: {0}")]
    Watch(#[from] mesh_hub_k8s_utils::Error),

    #[error("timed out waiting for cache sync on cluster {cluster}")]
    CacheSyncTimeout { cluster: String },

    #[error("cache for cluster {cluster} failed: {source}")]
    CacheFailed {
        cluster: String,
        #[source]
        source: Arc<Error>,
    },

    #[error("cache for cluster {0} was already started")]
    CacheAlreadyStarted(String),

    #[error("watch task panicked: {0}")]
    WatchTaskPanicked(String),

    #[error("failed to create manager for cluster {cluster}: {source}")]
    ManagerCreation {
        cluster: String,
        #[source]
        source: kube::Error,
    },

    #[error("startup hook failed for cluster {cluster}: {source}")]
    StartupHook {
        cluster: String,
        #[source]
        source: BoxError,
    },

    #[error("handler {handler} failed for cluster {cluster}: {source}")]
    Handler {
        handler: String,
        cluster: String,
        #[source]
        source: BoxError,
    },

    #[error("no manager registered for cluster {0}")]
    NoManagerForCluster(String),

    #[error("{kind} {name} is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },

    #[error("{kind} {name} is not registered")]
    NotRegistered { kind: &'static str, name: String },
}
