use thiserror::Error;

pub mod labels;
pub mod names;
pub mod v1alpha1;

use kube::CustomResourceExt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub fn crd_gen_all() -> Result<()> {
    let crds = vec![
        v1alpha1::mesh::Mesh::crd(),
        v1alpha1::mesh_workload::MeshWorkload::crd(),
        v1alpha1::mesh_service::MeshService::crd(),
        v1alpha1::cluster::KubernetesCluster::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
