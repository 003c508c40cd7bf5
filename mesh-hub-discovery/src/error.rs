use mesh_hub_crds::v1alpha1::mesh::MeshType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("record store error: {0}")]
    Records(#[from] mesh_hub_k8s_utils::Error),

    #[error("multicluster error: {0}")]
    Multicluster(#[from] mesh_hub_multicluster::Error),

    #[error("{mesh_type} scanner failed on {object}: {reason}")]
    Scan {
        mesh_type: MeshType,
        object: String,
        reason: String,
    },

    #[error("mesh spec has no mesh type set")]
    UntypedMesh,
}

impl Error {
    pub(crate) fn scan(mesh_type: MeshType, object: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Scan {
            mesh_type,
            object: object.into(),
            reason: reason.into(),
        }
    }
}
